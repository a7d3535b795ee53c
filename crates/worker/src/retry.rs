use std::future::Future;
use std::time::Duration;

use tracing::warn;

use chaos_domain::OrchestratorResult;

/// 只读检查的固定间隔重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// 重试幂等的只读操作，带副作用的调用不能经过这里
    pub async fn retry_idempotent<T, F, Fut>(&self, what: &str, mut operation: F) -> OrchestratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && e.is_retryable() => {
                    warn!(
                        "{} 第 {}/{} 次尝试失败: {}，{:?} 后重试",
                        what, attempt, self.attempts, e, self.interval
                    );
                    attempt += 1;
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
