//! 领域事件订阅者
//!
//! 每个订阅者在节点启动时订阅自己关心的通道，运行在独立的后台任务中。
//! 订阅者的失败只记录日志，不影响任务结果。

use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chaos_domain::{
    OrchestratorResult, OwnershipMap, ScheduleStatus, Task, TaskCompletedEvent, TaskModifiedEvent,
    TaskRepository,
};

/// 按任务状态维护所有权映射中的条目
pub struct OwnershipSyncSubscriber {
    ownership: Arc<dyn OwnershipMap>,
}

impl OwnershipSyncSubscriber {
    pub fn new(ownership: Arc<dyn OwnershipMap>) -> Self {
        Self { ownership }
    }

    pub fn spawn(self, mut events: broadcast::Receiver<TaskModifiedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.on_task_modified(&event.task).await {
                            warn!("同步任务 {} 的所有权条目失败: {}", event.task.id, e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("所有权同步订阅者落后，丢弃 {} 个事件", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn on_task_modified(&self, task: &Task) -> OrchestratorResult<()> {
        if task.is_scheduled_task {
            if matches!(
                task.schedule_status,
                Some(ScheduleStatus::Paused | ScheduleStatus::Cancelled | ScheduleStatus::Finished)
            ) {
                self.ownership.remove(&task.id).await?;
            }
            return Ok(());
        }

        if task.is_terminal() {
            if self.ownership.remove(&task.id).await? {
                debug!("任务 {} 已结束，删除所有权条目", task.id);
            }
        } else {
            self.ownership
                .add_or_update(&task.id, task.status().as_str())
                .await?;
        }
        Ok(())
    }
}

/// 每个触发只统计一次完成指标
pub struct MetricsSubscriber {
    store: Arc<dyn TaskRepository>,
}

impl MetricsSubscriber {
    pub fn new(store: Arc<dyn TaskRepository>) -> Self {
        Self { store }
    }

    pub fn spawn(self, mut events: broadcast::Receiver<TaskCompletedEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.on_task_completed(&event).await {
                            warn!("记录任务 {} 的完成指标失败: {}", event.task.id, e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("指标订阅者落后，丢弃 {} 个事件", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// 返回本次是否记录了指标
    pub async fn on_task_completed(&self, event: &TaskCompletedEvent) -> OrchestratorResult<bool> {
        let Some(mut task) = self.store.get(&event.task.id).await? else {
            return Ok(false);
        };
        // 事件之后已开始新的触发时不再回写
        if task.triggers.len() != event.task.triggers.len() {
            return Ok(false);
        }
        let loaded_at = task.last_updated;
        let status = task.status();
        let Some(trigger) = task.active_trigger_mut() else {
            return Ok(false);
        };
        if trigger.is_trigger_metric_collected || !status.is_terminal() {
            return Ok(false);
        }
        trigger.is_trigger_metric_collected = true;

        counter!(
            "chaos_tasks_completed_total",
            "status" => status.as_str(),
            "task_type" => task.task_type.as_str()
        )
        .increment(1);

        if self.store.save_if_unchanged(&task, loaded_at).await?.is_none() {
            debug!("任务 {} 在记录指标期间被修改，跳过标记回写", task.id);
        }
        Ok(true)
    }
}
