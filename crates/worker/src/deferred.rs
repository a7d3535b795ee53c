use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chaos_domain::TaskId;

struct DeferredOperation {
    name: String,
    handle: JoinHandle<()>,
}

/// 按任务登记的可取消延迟操作（修复定时器、调度循环等）
///
/// 取消是协作式的：先对未完成的操作发出中断，再在有限时间内等待它们退出。
#[derive(Clone, Default)]
pub struct DeferredOperations {
    operations: Arc<Mutex<HashMap<TaskId, Vec<DeferredOperation>>>>,
}

impl DeferredOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在后台运行 `operation`，返回其结果的接收端
    ///
    /// 操作被取消时接收端得到 `RecvError`。
    pub async fn schedule<F>(
        &self,
        task_id: &str,
        name: &str,
        operation: F,
    ) -> oneshot::Receiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let output = operation.await;
            let _ = sender.send(output);
        });

        let mut operations = self.operations.lock().await;
        let entry = operations.entry(task_id.to_string()).or_default();
        entry.retain(|op| !op.handle.is_finished());
        entry.push(DeferredOperation {
            name: name.to_string(),
            handle,
        });
        debug!("任务 {} 登记延迟操作 {}", task_id, name);
        receiver
    }

    pub async fn pending(&self, task_id: &str) -> usize {
        let operations = self.operations.lock().await;
        operations
            .get(task_id)
            .map(|ops| ops.iter().filter(|op| !op.handle.is_finished()).count())
            .unwrap_or(0)
    }

    /// 取消任务下所有未完成的延迟操作，返回被中断的数量
    ///
    /// 超过 `wait` 仍未退出的操作不再等待。
    pub async fn cancel_all(&self, task_id: &str, wait: Duration) -> usize {
        let operations = {
            let mut operations = self.operations.lock().await;
            operations.remove(task_id).unwrap_or_default()
        };

        let mut handles = Vec::new();
        for op in operations {
            if op.handle.is_finished() {
                continue;
            }
            debug!("取消任务 {} 的延迟操作 {}", task_id, op.name);
            op.handle.abort();
            handles.push(op.handle);
        }

        let cancelled = handles.len();
        if cancelled > 0 && tokio::time::timeout(wait, join_all(handles)).await.is_err() {
            warn!(
                "任务 {} 的 {} 个延迟操作在 {:?} 内未确认停止",
                task_id, cancelled, wait
            );
        }
        cancelled
    }

    pub async fn cancel_everything(&self, wait: Duration) -> usize {
        let task_ids: Vec<TaskId> = self.operations.lock().await.keys().cloned().collect();
        let mut cancelled = 0;
        for task_id in task_ids {
            cancelled += self.cancel_all(&task_id, wait).await;
        }
        cancelled
    }
}
