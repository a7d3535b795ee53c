use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 任务执行相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent_tasks: usize,
    /// 等待子任务时的轮询间隔（毫秒）
    pub child_poll_interval_ms: u64,
    /// 等待全部子任务结束的最长时间（秒）
    pub child_timeout_seconds: u64,
    /// 修复时等待延迟操作停止的最长时间（毫秒）
    pub cancellation_wait_ms: u64,
    /// 连通性检查的最大尝试次数
    pub connectivity_retry_attempts: u32,
    /// 连通性检查的重试间隔（毫秒）
    pub connectivity_retry_interval_ms: u64,
    /// 命令未声明重试间隔时使用的默认值（秒）
    pub command_retry_interval_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 32,
            child_poll_interval_ms: 1000,
            child_timeout_seconds: 360,
            cancellation_wait_ms: 5000,
            connectivity_retry_attempts: 3,
            connectivity_retry_interval_ms: 2000,
            command_retry_interval_seconds: 5,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }
        if self.child_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("子任务轮询间隔必须大于0"));
        }
        if self.child_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("子任务等待超时必须大于0"));
        }
        if self.connectivity_retry_attempts == 0 {
            return Err(anyhow::anyhow!("连通性检查次数至少为1"));
        }
        Ok(())
    }

    pub fn child_poll_interval(&self) -> Duration {
        Duration::from_millis(self.child_poll_interval_ms)
    }

    pub fn child_timeout(&self) -> Duration {
        Duration::from_secs(self.child_timeout_seconds)
    }

    pub fn cancellation_wait(&self) -> Duration {
        Duration::from_millis(self.cancellation_wait_ms)
    }

    pub fn connectivity_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_retry_interval_ms)
    }
}
