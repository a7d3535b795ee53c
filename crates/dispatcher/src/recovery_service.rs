use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use chaos_domain::{OrchestratorResult, OwnershipMap, ScheduleStatus, TaskId, TaskRepository};

use crate::orchestrator::entry_value;

/// 启动恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub reinserted_tasks: Vec<TaskId>,
    pub reinserted_schedules: Vec<TaskId>,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.reinserted_tasks.len() + self.reinserted_schedules.len()
    }
}

/// 集群整体重启后根据持久化存储重建所有权映射
///
/// 只插入缺失的条目，已有条目保持不变；插入触发 "added" 回调，
/// 由幂等保护决定接手方式。
pub struct RecoveryService {
    store: Arc<dyn TaskRepository>,
    ownership: Arc<dyn OwnershipMap>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn TaskRepository>, ownership: Arc<dyn OwnershipMap>) -> Self {
        Self { store, ownership }
    }

    pub async fn rebuild_ownership(&self) -> OrchestratorResult<RecoveryReport> {
        let start_time = Instant::now();
        let mut report = RecoveryReport::default();
        info!("开始重建所有权映射");

        for task in self.store.find_unfinished().await? {
            if task.is_scheduled_task {
                continue;
            }
            match self.reinsert(&task.id, entry_value(&task)).await {
                Ok(true) => report.reinserted_tasks.push(task.id),
                Ok(false) => debug!("任务 {} 的所有权条目已存在", task.id),
                Err(e) => {
                    warn!("重新插入任务 {} 失败: {}", task.id, e);
                    report.errors.push(format!("任务 {}: {}", task.id, e));
                }
            }
        }

        for task_id in self.store.find_active_schedule_ids().await? {
            match self
                .reinsert(&task_id, ScheduleStatus::Scheduled.as_str())
                .await
            {
                Ok(true) => report.reinserted_schedules.push(task_id),
                Ok(false) => debug!("调度任务 {} 的所有权条目已存在", task_id),
                Err(e) => {
                    warn!("重新插入调度任务 {} 失败: {}", task_id, e);
                    report.errors.push(format!("调度任务 {}: {}", task_id, e));
                }
            }
        }

        report.recovery_duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "所有权映射重建完成，重新插入任务 {} 个、调度任务 {} 个，耗时 {}ms，错误 {} 个",
            report.reinserted_tasks.len(),
            report.reinserted_schedules.len(),
            report.recovery_duration_ms,
            report.errors.len()
        );
        Ok(report)
    }

    async fn reinsert(&self, task_id: &str, value: &str) -> OrchestratorResult<bool> {
        if self.ownership.get(task_id).await?.is_some() {
            return Ok(false);
        }
        self.ownership.add_or_update(task_id, value).await?;
        Ok(true)
    }
}
