//! 所有权回调处理
//!
//! 只有拥有键所在分区的节点会收到回调。回调本身只做分派，驱动任务交给
//! 执行管理器的独立后台任务，不占用映射的分发循环。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use chaos_domain::{
    EntryListener, OrchestratorResult, OwnershipMap, ScheduleStatus, Task, TaskRepository,
    TaskStatus, REMEDIATION_REQUESTED,
};
use chaos_worker::TaskExecutionManager;

use crate::schedule_runner::ScheduleRunner;

/// 幂等保护的判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    /// 任务未被触及，从头驱动
    Drive,
    /// 上一个驱动节点已不在集群中，从最后持久化的子阶段继续
    Resume,
    /// 任务正由存活节点驱动，保留条目
    BackOff { driver: String },
    /// 任务已结束，删除过期条目
    RemoveStale,
    /// 调度任务：启动调度循环
    StartSchedule,
}

pub struct OwnershipListener {
    store: Arc<dyn TaskRepository>,
    ownership: Arc<dyn OwnershipMap>,
    execution: Arc<TaskExecutionManager>,
    schedules: Arc<ScheduleRunner>,
}

impl OwnershipListener {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        ownership: Arc<dyn OwnershipMap>,
        execution: Arc<TaskExecutionManager>,
        schedules: Arc<ScheduleRunner>,
    ) -> Self {
        Self {
            store,
            ownership,
            execution,
            schedules,
        }
    }

    /// 幂等保护：根据持久化状态决定本节点如何处理新获得的任务
    pub async fn decide(&self, task: &Task) -> OrchestratorResult<TriggerDecision> {
        let local = self.ownership.local_node_id();

        if task.is_scheduled_task {
            return Ok(match task.schedule_status {
                Some(ScheduleStatus::Scheduled) => TriggerDecision::StartSchedule,
                _ => TriggerDecision::RemoveStale,
            });
        }

        match task.status() {
            TaskStatus::Initializing => Ok(TriggerDecision::Drive),
            TaskStatus::Completed | TaskStatus::Failed => Ok(TriggerDecision::RemoveStale),
            TaskStatus::InProgress => {
                if self.execution.is_running(&task.id).await {
                    return Ok(TriggerDecision::BackOff {
                        driver: local.to_string(),
                    });
                }
                match self.ownership.driving_node(&task.id).await? {
                    Some(driver) if driver != local && self.ownership.is_member(&driver).await? => {
                        Ok(TriggerDecision::BackOff { driver })
                    }
                    _ => Ok(TriggerDecision::Resume),
                }
            }
        }
    }

    /// 处理新获得所有权的任务
    pub async fn trigger_task(&self, task_id: &str) -> OrchestratorResult<()> {
        let Some(task) = self.store.get(task_id).await? else {
            warn!("所有权条目 {} 对应的任务不存在，删除条目", task_id);
            self.ownership.remove(task_id).await?;
            return Ok(());
        };

        let decision = self.decide(&task).await?;
        debug!("任务 {} 的触发判定: {:?}", task_id, decision);
        match decision {
            TriggerDecision::Drive => {
                self.ownership.claim(task_id).await?;
                self.execution.execute(task, false).await?;
            }
            TriggerDecision::Resume => {
                info!(
                    "任务 {} 的驱动节点已离开，从子阶段 {:?} 恢复",
                    task_id,
                    task.current_stage()
                );
                self.ownership.claim(task_id).await?;
                self.execution.execute(task, false).await?;
            }
            TriggerDecision::BackOff { driver } => {
                debug!("任务 {} 正由节点 {} 驱动，本节点不重复触发", task_id, driver);
            }
            TriggerDecision::RemoveStale => {
                debug!("任务 {} 已结束，删除过期的所有权条目", task_id);
                self.ownership.release(task_id).await?;
                self.ownership.remove(task_id).await?;
            }
            TriggerDecision::StartSchedule => {
                // 上一个所有者宕机时正在进行的运行需要继续
                if task.status() == TaskStatus::InProgress
                    && !self.execution.is_running(task_id).await
                    && !self.driven_elsewhere(task_id).await?
                {
                    self.ownership.claim(task_id).await?;
                    self.execution.execute(task, false).await?;
                }
                self.schedules.start(task_id).await;
            }
        }
        Ok(())
    }

    async fn driven_elsewhere(&self, task_id: &str) -> OrchestratorResult<bool> {
        match self.ownership.driving_node(task_id).await? {
            Some(driver) if driver != self.ownership.local_node_id() => {
                self.ownership.is_member(&driver).await
            }
            _ => Ok(false),
        }
    }

    async fn handle_update(&self, task_id: &str, value: &str) -> OrchestratorResult<()> {
        if value == REMEDIATION_REQUESTED {
            // 取消需要等待延迟操作退出，不能占用分发循环
            let execution = Arc::clone(&self.execution);
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                let cancelled = execution.cancel_deferred(&task_id).await;
                info!("任务 {} 收到修复请求，取消延迟操作 {} 个", task_id, cancelled);
            });
            return Ok(());
        }

        match value.parse::<ScheduleStatus>() {
            Ok(ScheduleStatus::Scheduled) => self.trigger_task(task_id).await,
            Ok(status) => {
                self.schedules.stop(task_id).await;
                self.ownership.release(task_id).await?;
                self.ownership.remove(task_id).await?;
                info!("调度任务 {} 进入 {}，已清理", task_id, status);
                Ok(())
            }
            Err(_) => {
                debug!("任务 {} 的状态更新为 {}", task_id, value);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EntryListener for OwnershipListener {
    async fn entry_added(&self, key: &str, value: &str) {
        debug!("获得任务 {} 的所有权，当前值 {}", key, value);
        if let Err(e) = self.trigger_task(key).await {
            error!("触发任务 {} 失败，等待下一次所有权评估: {}", key, e);
        }
    }

    async fn entry_updated(&self, key: &str, old_value: &str, value: &str) {
        debug!("任务 {} 的条目从 {} 更新为 {}", key, old_value, value);
        if let Err(e) = self.handle_update(key, value).await {
            error!("处理任务 {} 的条目更新失败: {}", key, e);
        }
    }

    async fn entry_removed(&self, key: &str) {
        self.schedules.stop(key).await;
        if let Err(e) = self.ownership.release(key).await {
            warn!("释放任务 {} 的节点亲和记录失败: {}", key, e);
        }
        debug!("任务 {} 的所有权条目已删除", key);
    }

    async fn entry_evicted(&self, key: &str) {
        warn!("任务 {} 的所有权条目因TTL被驱逐", key);
    }
}
