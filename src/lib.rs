// Media Upload Queue Library
// 媒体库上传队列核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传事件模块
pub mod events;

// 上传队列模块
pub mod uploader;

// 公共模块（请求合并等）
pub mod common;

// 导出常用类型
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use events::{BatchResult, UploadEvent};
pub use uploader::{
    CandidateId, FolderScanner, HttpUploadTransport, QueueError, ScanOptions, SelectedFile,
    TransportError, UploadCandidate, UploadQueueController, UploadStatus, UploadTransport,
    UploadedMedia,
};
