use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use chaos_domain::{
    FaultSpec, OrchestratorError, OrchestratorResult, OwnershipMap, ScheduleStatus, Task,
    TaskCreatedEvent, TaskEventPublisher, TaskFilter, TaskModifiedEvent, TaskRepository,
    REMEDIATION_REQUESTED,
};
use chaos_worker::HelperRegistry;

/// 对外暴露的编排操作
#[async_trait]
pub trait TaskOrchestrator: Send + Sync {
    /// 创建 INITIALIZING 任务并写入所有权映射
    async fn submit(&self, spec: FaultSpec) -> OrchestratorResult<Task>;

    /// 为注入任务创建修复任务
    async fn remediate(&self, task_id: &str) -> OrchestratorResult<Task>;

    async fn get_task(&self, task_id: &str) -> OrchestratorResult<Task>;

    async fn find_tasks(&self, filter: &TaskFilter) -> OrchestratorResult<Vec<Task>>;

    async fn pause_schedule(&self, task_id: &str) -> OrchestratorResult<Task>;

    async fn resume_schedule(&self, task_id: &str) -> OrchestratorResult<Task>;

    async fn cancel_schedule(&self, task_id: &str) -> OrchestratorResult<Task>;
}

/// 所有权映射中条目的值
pub fn entry_value(task: &Task) -> &'static str {
    match (task.is_scheduled_task, task.schedule_status) {
        (true, Some(status)) => status.as_str(),
        _ => task.status().as_str(),
    }
}

pub struct OrchestrationService {
    store: Arc<dyn TaskRepository>,
    ownership: Arc<dyn OwnershipMap>,
    registry: HelperRegistry,
    events: Arc<dyn TaskEventPublisher>,
    /// 串行化本节点上的修复请求，保证检查与标记之间不会插入另一个请求
    remediation_lock: Mutex<()>,
}

impl OrchestrationService {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        ownership: Arc<dyn OwnershipMap>,
        registry: HelperRegistry,
        events: Arc<dyn TaskEventPublisher>,
    ) -> Self {
        Self {
            store,
            ownership,
            registry,
            events,
            remediation_lock: Mutex::new(()),
        }
    }

    /// 持久化新任务、发布创建事件并写入所有权映射
    pub async fn enqueue(&self, task: Task) -> OrchestratorResult<Task> {
        let task = self.store.save(&task).await?;
        self.events.task_created(TaskCreatedEvent::new(&task));
        self.ownership
            .add_or_update(&task.id, entry_value(&task))
            .await?;
        Ok(task)
    }

    async fn load(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))
    }

    async fn load_schedule(&self, task_id: &str) -> OrchestratorResult<Task> {
        let task = self.load(task_id).await?;
        if !task.is_scheduled_task {
            return Err(OrchestratorError::validation(format!(
                "任务 {task_id} 不是调度任务"
            )));
        }
        Ok(task)
    }

    async fn update_schedule(
        &self,
        mut task: Task,
        status: ScheduleStatus,
    ) -> OrchestratorResult<Task> {
        task.schedule_status = Some(status);
        let task = self.store.save(&task).await?;
        self.events.task_modified(TaskModifiedEvent::new(&task));
        Ok(task)
    }
}

#[async_trait]
impl TaskOrchestrator for OrchestrationService {
    #[instrument(skip_all, fields(fault = %spec.fault_name, extension = %spec.extension_name))]
    async fn submit(&self, spec: FaultSpec) -> OrchestratorResult<Task> {
        let helper = self.registry.get(&spec.extension_name).await.ok_or_else(|| {
            OrchestratorError::UnsupportedExtension {
                extension: spec.extension_name.clone(),
            }
        })?;
        helper.validate(&spec)?;

        let task = Task::new(helper.injection_task_type(), spec);
        let task = self.enqueue(task).await?;
        info!("任务 {} 已提交，类型 {}", task.id, task.task_type);
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn remediate(&self, task_id: &str) -> OrchestratorResult<Task> {
        let _guard = self.remediation_lock.lock().await;

        let mut injection = self.load(task_id).await?;
        if injection.remediated {
            warn!("任务 {} 已修复，拒绝重复修复", task_id);
            return Err(OrchestratorError::already_remediated(task_id));
        }
        if !injection.task_type.is_remediable() {
            return Err(OrchestratorError::validation(format!(
                "任务类型 {} 不支持修复",
                injection.task_type
            )));
        }
        if let Err(e) = injection.ensure_ready_for_remediation() {
            warn!("任务 {} 当前状态不可修复: {}", task_id, e);
            return Err(e);
        }

        let remediation = Task::remediation_of(&injection);
        injection.remediated = true;
        injection.remediation_task_id = Some(remediation.id.clone());
        let injection = self.store.save(&injection).await?;
        self.events.task_modified(TaskModifiedEvent::new(&injection));

        // 注入任务仍在映射中时通知其所有者取消延迟操作
        if self.ownership.get(&injection.id).await?.is_some() {
            self.ownership
                .add_or_update(&injection.id, REMEDIATION_REQUESTED)
                .await?;
        }

        let remediation = self.enqueue(remediation).await?;
        info!("已为任务 {} 创建修复任务 {}", task_id, remediation.id);
        Ok(remediation)
    }

    async fn get_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.load(task_id).await
    }

    async fn find_tasks(&self, filter: &TaskFilter) -> OrchestratorResult<Vec<Task>> {
        self.store.find_by_filter(filter).await
    }

    async fn pause_schedule(&self, task_id: &str) -> OrchestratorResult<Task> {
        let task = self.load_schedule(task_id).await?;
        if task.schedule_status != Some(ScheduleStatus::Scheduled) {
            return Err(OrchestratorError::validation(format!(
                "调度任务 {task_id} 当前状态为 {:?}，无法暂停",
                task.schedule_status
            )));
        }
        let task = self.update_schedule(task, ScheduleStatus::Paused).await?;
        self.ownership.remove(&task.id).await?;
        info!("调度任务 {} 已暂停", task_id);
        Ok(task)
    }

    async fn resume_schedule(&self, task_id: &str) -> OrchestratorResult<Task> {
        let task = self.load_schedule(task_id).await?;
        if task.schedule_status != Some(ScheduleStatus::Paused) {
            return Err(OrchestratorError::validation(format!(
                "调度任务 {task_id} 当前状态为 {:?}，无法恢复",
                task.schedule_status
            )));
        }
        let task = self.update_schedule(task, ScheduleStatus::Scheduled).await?;
        self.ownership
            .add_or_update(&task.id, ScheduleStatus::Scheduled.as_str())
            .await?;
        info!("调度任务 {} 已恢复", task_id);
        Ok(task)
    }

    async fn cancel_schedule(&self, task_id: &str) -> OrchestratorResult<Task> {
        let task = self.load_schedule(task_id).await?;
        if matches!(
            task.schedule_status,
            Some(ScheduleStatus::Cancelled | ScheduleStatus::Finished)
        ) {
            return Err(OrchestratorError::validation(format!(
                "调度任务 {task_id} 已结束"
            )));
        }
        let task = self.update_schedule(task, ScheduleStatus::Cancelled).await?;
        self.ownership.remove(&task.id).await?;
        info!("调度任务 {} 已取消", task_id);
        Ok(task)
    }
}
