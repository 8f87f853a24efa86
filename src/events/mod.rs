//! 事件模块
//!
//! 定义上传队列对外发布的事件
//! - `types.rs`: 上传事件类型与批次结果
//! - `throttle.rs`: 进度节流，控制进度更新的频率

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
