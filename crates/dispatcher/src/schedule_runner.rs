use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chaos_domain::{
    OrchestratorError, OrchestratorResult, OwnershipMap, ScheduleStatus, Task, TaskEventPublisher,
    TaskId, TaskModifiedEvent, TaskRepository,
};
use chaos_worker::TaskExecutionManager;

use crate::cron_utils::{next_fire_time, CronScheduler};

const RUN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MISSED_RUN_GRACE_MINUTES: i64 = 5;

/// 在所有者节点上运行调度任务的循环
///
/// 每次到期都为任务压入新的触发记录，历史触发保持不变。
pub struct ScheduleRunner {
    store: Arc<dyn TaskRepository>,
    execution: Arc<TaskExecutionManager>,
    ownership: Arc<dyn OwnershipMap>,
    events: Arc<dyn TaskEventPublisher>,
    loops: Arc<RwLock<HashMap<TaskId, JoinHandle<()>>>>,
}

impl ScheduleRunner {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        execution: Arc<TaskExecutionManager>,
        ownership: Arc<dyn OwnershipMap>,
        events: Arc<dyn TaskEventPublisher>,
    ) -> Self {
        Self {
            store,
            execution,
            ownership,
            events,
            loops: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.loops
            .read()
            .await
            .get(task_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 启动调度循环，已在运行时返回 false
    pub async fn start(&self, task_id: &str) -> bool {
        let mut loops = self.loops.write().await;
        loops.retain(|_, handle| !handle.is_finished());
        if loops.contains_key(task_id) {
            debug!("调度任务 {} 的循环已在运行", task_id);
            return false;
        }

        let worker = ScheduleLoop {
            task_id: task_id.to_string(),
            store: Arc::clone(&self.store),
            execution: Arc::clone(&self.execution),
            ownership: Arc::clone(&self.ownership),
            events: Arc::clone(&self.events),
        };
        let handle = tokio::spawn(async move {
            let task_id = worker.task_id.clone();
            if let Err(e) = worker.run().await {
                error!("调度任务 {} 的循环异常退出: {}", task_id, e);
            }
        });
        loops.insert(task_id.to_string(), handle);
        info!("调度任务 {} 的循环已启动", task_id);
        true
    }

    pub async fn stop(&self, task_id: &str) -> bool {
        match self.loops.write().await.remove(task_id) {
            Some(handle) => {
                handle.abort();
                info!("调度任务 {} 的循环已停止", task_id);
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let mut loops = self.loops.write().await;
        for (_, handle) in loops.drain() {
            handle.abort();
        }
    }
}

struct ScheduleLoop {
    task_id: TaskId,
    store: Arc<dyn TaskRepository>,
    execution: Arc<TaskExecutionManager>,
    ownership: Arc<dyn OwnershipMap>,
    events: Arc<dyn TaskEventPublisher>,
}

impl ScheduleLoop {
    async fn run(self) -> OrchestratorResult<()> {
        let mut last_fire = None;
        loop {
            let Some(task) = self.load_active().await? else {
                return Ok(());
            };
            let spec = task.task_data.schedule.clone().ok_or_else(|| {
                OrchestratorError::validation(format!("调度任务 {} 缺少调度定义", task.id))
            })?;

            if let (Some(expr), Some(last)) = (
                &spec.cron_expression,
                task.active_trigger().and_then(|t| t.start_time),
            ) {
                if CronScheduler::new(expr)?.is_task_overdue(last, Utc::now(), MISSED_RUN_GRACE_MINUTES) {
                    warn!("调度任务 {} 错过了执行时间，从下一个时间点继续", task.id);
                }
            }

            let now = Utc::now();
            let from = last_fire.map_or(now, |last| now.max(last));
            let Some(fire_at) = next_fire_time(&spec, !task.triggers.is_empty(), from)? else {
                self.wait_for_run().await;
                self.finish(task).await?;
                return Ok(());
            };
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            debug!("调度任务 {} 下次运行于 {}，等待 {:?}", self.task_id, fire_at, wait);
            tokio::time::sleep(wait).await;
            last_fire = Some(fire_at);

            let Some(task) = self.load_active().await? else {
                return Ok(());
            };
            if self.execution.is_running(&task.id).await {
                warn!("调度任务 {} 的上一次运行尚未结束，跳过本次运行", task.id);
                continue;
            }
            info!("调度任务 {} 开始第 {} 次运行", task.id, task.triggers.len() + 1);
            self.execution.execute(task, true).await?;
            if !spec.is_recurring() {
                self.wait_for_run().await;
            }
        }
    }

    async fn wait_for_run(&self) {
        while self.execution.is_running(&self.task_id).await {
            tokio::time::sleep(RUN_POLL_INTERVAL).await;
        }
    }

    async fn load_active(&self) -> OrchestratorResult<Option<Task>> {
        match self.store.get(&self.task_id).await? {
            Some(task) if task.schedule_status == Some(ScheduleStatus::Scheduled) => Ok(Some(task)),
            Some(task) => {
                debug!(
                    "调度任务 {} 状态为 {:?}，循环结束",
                    task.id, task.schedule_status
                );
                Ok(None)
            }
            None => {
                warn!("调度任务 {} 不存在，循环结束", self.task_id);
                Ok(None)
            }
        }
    }

    async fn finish(&self, task: Task) -> OrchestratorResult<()> {
        // 运行期间任务记录可能已更新，以最新记录为准
        let mut task = self.store.get(&task.id).await?.unwrap_or(task);
        task.schedule_status = Some(ScheduleStatus::Finished);
        let task = self.store.save(&task).await?;
        self.events.task_modified(TaskModifiedEvent::new(&task));
        self.ownership
            .add_or_update(&task.id, ScheduleStatus::Finished.as_str())
            .await?;
        info!("一次性调度任务 {} 已结束", task.id);
        Ok(())
    }
}
