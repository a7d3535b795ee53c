use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use chaos_domain::{
    entities::{Task, TaskFilter, TaskId},
    repositories::TaskRepository,
    OrchestratorResult, TaskStatus,
};

/// 内存任务存储
///
/// 单进程内强一致，适合嵌入式运行和测试。
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn save(&self, task: &Task) -> OrchestratorResult<Task> {
        let mut saved = task.clone();
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&saved.id) {
            if existing.last_updated > saved.last_updated {
                saved.last_updated = existing.last_updated;
            }
        }
        saved.touch();
        tasks.insert(saved.id.clone(), saved.clone());
        debug!("保存任务 {}，状态 {}", saved.id, saved.status());
        Ok(saved)
    }

    async fn save_if_unchanged(
        &self,
        task: &Task,
        expected_last_updated: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        let current = tasks.get(&task.id).map(|existing| existing.last_updated);
        if current != Some(expected_last_updated) {
            debug!("任务 {} 已被其他写入更新，放弃条件保存", task.id);
            return Ok(None);
        }
        let mut saved = task.clone();
        saved.last_updated = expected_last_updated;
        saved.touch();
        tasks.insert(saved.id.clone(), saved.clone());
        Ok(Some(saved))
    }

    async fn find_active_schedule_ids(&self) -> OrchestratorResult<Vec<TaskId>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|task| task.is_active_schedule())
            .map(|task| task.id.clone())
            .collect())
    }

    async fn find_by_filter(&self, filter: &TaskFilter) -> OrchestratorResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn find_unfinished(&self) -> OrchestratorResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|task| {
                matches!(
                    task.status(),
                    TaskStatus::Initializing | TaskStatus::InProgress
                )
            })
            .cloned()
            .collect())
    }
}
