use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chaos_domain::{
    OrchestratorResult, Task, TaskCompletedEvent, TaskEventPublisher, TaskId, TaskModifiedEvent,
    TaskStatus,
};

use crate::deferred::DeferredOperations;
use crate::driver::SubstageDriver;
use crate::helper::StageContext;
use crate::registry::HelperRegistry;

/// 节点本地的任务执行管理
///
/// 每个被驱动的任务占用一个后台任务，同一任务ID同时只会有一个驱动器。
pub struct TaskExecutionManager {
    node_id: String,
    registry: HelperRegistry,
    driver: Arc<SubstageDriver>,
    deferred: DeferredOperations,
    events: Arc<dyn TaskEventPublisher>,
    permits: Arc<Semaphore>,
    cancellation_wait: Duration,
    running_tasks: Arc<RwLock<HashMap<TaskId, JoinHandle<()>>>>,
}

impl TaskExecutionManager {
    pub fn new(
        ctx: StageContext,
        registry: HelperRegistry,
        events: Arc<dyn TaskEventPublisher>,
    ) -> Self {
        let max_concurrent_tasks = ctx.config.max_concurrent_tasks.max(1);
        let cancellation_wait = ctx.config.cancellation_wait();
        Self {
            node_id: ctx.node_id.clone(),
            registry,
            deferred: ctx.deferred.clone(),
            driver: Arc::new(SubstageDriver::new(ctx, Arc::clone(&events))),
            events,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
            cancellation_wait,
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &HelperRegistry {
        &self.registry
    }

    pub fn deferred(&self) -> &DeferredOperations {
        &self.deferred
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.running_tasks
            .read()
            .await
            .get(task_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn get_current_task_count(&self) -> usize {
        self.running_tasks
            .read()
            .await
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// 在后台驱动任务，返回是否真正启动了新的驱动器
    ///
    /// `fresh_trigger` 为 true 时总是压入新的触发记录（调度任务的每次运行）。
    pub async fn execute(&self, task: Task, fresh_trigger: bool) -> OrchestratorResult<bool> {
        let helper = match self.registry.get(&task.extension_name).await {
            Some(helper) => helper,
            None => {
                error!("扩展 '{}' 没有注册对应的处理器", task.extension_name);
                self.reject_unsupported(task).await?;
                return Ok(false);
            }
        };

        let mut running_tasks = self.running_tasks.write().await;
        running_tasks.retain(|_, handle| !handle.is_finished());
        if running_tasks.contains_key(&task.id) {
            info!("任务 {} 已在本节点运行，忽略重复触发", task.id);
            return Ok(false);
        }

        let task_id = task.id.clone();
        let driver = Arc::clone(&self.driver);
        let permits = Arc::clone(&self.permits);
        let running_tasks_clone = Arc::clone(&self.running_tasks);
        let spawned_id = task_id.clone();

        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("执行许可已关闭，任务 {} 未被驱动", spawned_id);
                    return;
                }
            };
            let execution_start = tokio::time::Instant::now();
            match driver.drive(task, helper, fresh_trigger).await {
                Ok(task) => info!(
                    "任务 {} 驱动结束，状态 {}，耗时 {:?}",
                    task.id,
                    task.status(),
                    execution_start.elapsed()
                ),
                Err(e) => error!("任务 {} 的本次触发被放弃: {}", spawned_id, e),
            }
            running_tasks_clone.write().await.remove(&spawned_id);
        });

        running_tasks.insert(task_id, handle);
        Ok(true)
    }

    async fn reject_unsupported(&self, mut task: Task) -> OrchestratorResult<()> {
        if task.active_trigger().is_none() || task.is_terminal() {
            task.start_new_trigger(&self.node_id);
        }
        task.append_failure_reason(&format!("Unsupported extension: {}", task.extension_name));
        task.set_status(TaskStatus::Failed);
        let task = self.driver.context().store.save(&task).await?;
        self.events.task_modified(TaskModifiedEvent::new(&task));
        self.events.task_completed(TaskCompletedEvent::new(&task));
        Ok(())
    }

    /// 取消任务在本节点登记的延迟操作
    pub async fn cancel_deferred(&self, task_id: &str) -> usize {
        self.deferred.cancel_all(task_id, self.cancellation_wait).await
    }

    /// 停止本节点所有驱动器与延迟操作，任务保持已持久化的状态等待恢复
    pub async fn shutdown(&self) {
        let mut running_tasks = self.running_tasks.write().await;
        for (task_id, handle) in running_tasks.drain() {
            if !handle.is_finished() {
                warn!("停止仍在运行的任务 {}", task_id);
                handle.abort();
            }
        }
        drop(running_tasks);
        let cancelled = self.deferred.cancel_everything(self.cancellation_wait).await;
        self.permits.close();
        info!("节点 {} 执行管理器已停止，取消延迟操作 {}", self.node_id, cancelled);
    }
}
