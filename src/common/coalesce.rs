//! 请求合并器
//!
//! 多个并发调用方共享同一个进行中的请求（`futures::future::Shared`），
//! 结果在 TTL 内缓存，过期或被作废后由下一个调用方重新发起

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// 共享请求失败
///
/// `Shared` 要求输出可克隆，因此错误只保留消息文本
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoalesceError {
    #[error("请求失败: {0}")]
    Fetch(Arc<str>),
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, CoalesceError>>>;

enum Slot<T: Clone> {
    /// 无缓存
    Empty,
    /// 请求进行中
    InFlight {
        generation: u64,
        future: SharedFetch<T>,
    },
    /// 已缓存
    Ready { value: T, fetched_at: Instant },
}

struct CoalescerState<T: Clone> {
    slot: Slot<T>,
    /// 每次作废或发起新请求时递增，过期请求的结果不会写回缓存
    generation: u64,
}

/// 请求合并器
pub struct RequestCoalescer<T: Clone> {
    state: Mutex<CoalescerState<T>>,
    /// 缓存有效期（None 表示永久有效，直到作废）
    ttl: Option<Duration>,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(CoalescerState {
                slot: Slot::Empty,
                generation: 0,
            }),
            ttl,
        }
    }

    /// 获取缓存值，必要时发起请求
    ///
    /// 同一时刻最多只有一个 `fetch` 在执行，其他调用方等待同一个结果
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<T, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (generation, future) = {
            let mut state = self.state.lock();

            match &state.slot {
                Slot::Ready { value, fetched_at } if !self.is_expired(*fetched_at) => {
                    return Ok(value.clone());
                }
                Slot::InFlight { generation, future } => (*generation, future.clone()),
                _ => {
                    state.generation += 1;
                    let generation = state.generation;
                    debug!("发起共享请求: generation={}", generation);

                    let future = fetch()
                        .map(|result| result.map_err(|e| CoalesceError::Fetch(e.to_string().into())))
                        .boxed()
                        .shared();
                    state.slot = Slot::InFlight {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        let result = future.await;

        // 只有仍是当前这一代请求时才写回
        let mut state = self.state.lock();
        if let Slot::InFlight {
            generation: current,
            ..
        } = &state.slot
        {
            if *current == generation {
                state.slot = match &result {
                    Ok(value) => Slot::Ready {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                    },
                    Err(_) => Slot::Empty,
                };
            }
        }

        result
    }

    /// 作废缓存（进行中的请求结果也不再写回）
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.slot = Slot::Empty;
    }

    /// 当前是否持有未过期的缓存
    pub fn is_cached(&self) -> bool {
        match &self.state.lock().slot {
            Slot::Ready { fetched_at, .. } => !self.is_expired(*fetched_at),
            _ => false,
        }
    }

    fn is_expired(&self, fetched_at: Instant) -> bool {
        self.ttl
            .map(|ttl| fetched_at.elapsed() >= ttl)
            .unwrap_or(false)
    }
}
