//! 进度事件节流器
//!
//! 用于控制进度更新的写入频率，避免并发上传时的进度风暴
//! 每次上传尝试持有一个独立的节流器

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 尚未发布过的标记
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用原子操作避免锁竞争
/// 典型用法：每次收到进度时调用 `should_emit_progress()`，返回 true 时才写入状态
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布的时间戳（纳秒，相对进程基准时间）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 检查是否应该发布
    ///
    /// 第一次调用总是返回 true；之后距离上次发布超过节流间隔才返回 true
    pub fn should_emit(&self) -> bool {
        let now = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER_EMITTED && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // CAS 失败说明被其他调用抢先发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 进度专用：100% 总是放行
    pub fn should_emit_progress(&self, percent: u8) -> bool {
        if percent >= 100 {
            return self.force_emit();
        }
        self.should_emit()
    }

    /// 强制发布（用于最后一次更新或完成时）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(Self::current_nanos(), Ordering::Relaxed);
        true
    }

    /// 相对进程基准时间的纳秒数
    ///
    /// 使用 Instant 避免系统时钟跳变影响
    fn current_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::new(Duration::from_millis(100));

        // 第一次应该发布
        assert!(throttler.should_emit());

        // 立即再次调用，不应该发布
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::new(Duration::from_millis(50));

        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_complete_progress_always_emits() {
        let throttler = ProgressThrottler::new(Duration::from_millis(1000));

        assert!(throttler.should_emit_progress(10));
        assert!(!throttler.should_emit_progress(20));
        assert!(throttler.should_emit_progress(100));
    }
}
