use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chaos_core::OrchestratorResult;

use crate::entities::{Task, TaskFilter, TaskId};

/// 持久化任务存储
///
/// 单键读写必须强一致：写入节点随后的读取一定能看到自己的写入。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, id: &str) -> OrchestratorResult<Option<Task>>;
    /// 保存任务并返回带有最新 `last_updated` 的副本
    async fn save(&self, task: &Task) -> OrchestratorResult<Task>;
    /// 仅当存储中的 `last_updated` 仍为 `expected_last_updated` 时保存
    ///
    /// 比较与写入是一次原子操作；被其他写入抢先时返回 `None`。
    async fn save_if_unchanged(
        &self,
        task: &Task,
        expected_last_updated: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<Option<Task>>;
    async fn find_active_schedule_ids(&self) -> OrchestratorResult<Vec<TaskId>>;
    async fn find_by_filter(&self, filter: &TaskFilter) -> OrchestratorResult<Vec<Task>>;
    /// 活动触发仍为 INITIALIZING 或 IN_PROGRESS 的任务
    async fn find_unfinished(&self) -> OrchestratorResult<Vec<Task>>;
}
