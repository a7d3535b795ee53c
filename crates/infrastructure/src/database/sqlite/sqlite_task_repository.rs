use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chaos_domain::{
    entities::{Task, TaskFilter, TaskId},
    repositories::TaskRepository,
    OrchestratorError, OrchestratorResult, ScheduleStatus, TaskStatus,
};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

/// SQLite 任务存储
///
/// 完整的任务文档以 JSON 保存在 `payload` 列，状态、类型、端点和更新时间
/// 冗余到独立列上用于过滤查询。
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建嵌入式SQLite任务仓库，自动初始化数据库
    pub async fn new_embedded(database_url: &str, max_connections: u32) -> OrchestratorResult<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        debug!("创建嵌入式SQLite任务存储: {}", database_url);

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // 内存数据库每个连接各自独立，只能使用单连接
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        debug!("嵌入式SQLite任务存储创建成功");
        Ok(Self { pool })
    }

    /// 运行数据库迁移
    async fn run_migrations(pool: &SqlitePool) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chaos_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                extension_name TEXT NOT NULL,
                status TEXT NOT NULL,
                endpoint_name TEXT NOT NULL,
                is_scheduled INTEGER NOT NULL DEFAULT 0,
                schedule_status TEXT,
                payload TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                last_updated_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chaos_tasks_status ON chaos_tasks(status)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chaos_tasks_schedule ON chaos_tasks(is_scheduled, schedule_status)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chaos_tasks_updated ON chaos_tasks(last_updated_ms)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> OrchestratorResult<Task> {
        let payload: String = row.try_get("payload")?;
        serde_json::from_str(&payload).map_err(|e| {
            OrchestratorError::Serialization(format!("任务文档反序列化失败: {e}"))
        })
    }

    async fn current_last_updated(&self, id: &str) -> OrchestratorResult<Option<i64>> {
        let row = sqlx::query("SELECT last_updated_ms FROM chaos_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<i64, _>("last_updated_ms"))
            .transpose()
            .map_err(OrchestratorError::from)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        let row = sqlx::query("SELECT payload FROM chaos_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn save(&self, task: &Task) -> OrchestratorResult<Task> {
        let mut saved = task.clone();
        if let Some(stored_ms) = self.current_last_updated(&saved.id).await? {
            let stored = chrono::DateTime::from_timestamp_millis(stored_ms);
            if stored > saved.last_updated {
                saved.last_updated = stored;
            }
        }
        saved.touch();

        let payload = serde_json::to_string(&saved)?;
        let last_updated_ms = saved
            .last_updated
            .map(|at| at.timestamp_millis())
            .unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO chaos_tasks (
                id, task_type, extension_name, status, endpoint_name,
                is_scheduled, schedule_status, payload, created_at_ms, last_updated_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                schedule_status = excluded.schedule_status,
                payload = excluded.payload,
                last_updated_ms = excluded.last_updated_ms
            "#,
        )
        .bind(&saved.id)
        .bind(saved.task_type.as_str())
        .bind(&saved.extension_name)
        .bind(saved.status().as_str())
        .bind(&saved.task_data.endpoint_name)
        .bind(saved.is_scheduled_task)
        .bind(saved.schedule_status.map(|status| status.as_str()))
        .bind(&payload)
        .bind(saved.created_at.timestamp_millis())
        .bind(last_updated_ms)
        .execute(&self.pool)
        .await?;

        debug!("保存任务 {}，状态 {}", saved.id, saved.status());
        Ok(saved)
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn save_if_unchanged(
        &self,
        task: &Task,
        expected_last_updated: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<Option<Task>> {
        let mut saved = task.clone();
        saved.last_updated = expected_last_updated;
        saved.touch();

        let payload = serde_json::to_string(&saved)?;
        let last_updated_ms = saved
            .last_updated
            .map(|at| at.timestamp_millis())
            .unwrap_or_default();
        // 毫秒列可能碰撞，按文档中的完整时间戳比较
        let expected = serde_json::to_value(expected_last_updated)?
            .as_str()
            .map(str::to_string);

        let result = sqlx::query(
            r#"
            UPDATE chaos_tasks
            SET status = ?, schedule_status = ?, payload = ?, last_updated_ms = ?
            WHERE id = ? AND json_extract(payload, '$.last_updated') IS ?
            "#,
        )
        .bind(saved.status().as_str())
        .bind(saved.schedule_status.map(|status| status.as_str()))
        .bind(&payload)
        .bind(last_updated_ms)
        .bind(&saved.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("任务 {} 已被其他写入更新，放弃条件保存", saved.id);
            return Ok(None);
        }
        Ok(Some(saved))
    }

    #[instrument(skip(self))]
    async fn find_active_schedule_ids(&self) -> OrchestratorResult<Vec<TaskId>> {
        let rows = sqlx::query(
            "SELECT id FROM chaos_tasks WHERE is_scheduled = 1 AND schedule_status = ?",
        )
        .bind(ScheduleStatus::Scheduled.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(OrchestratorError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_by_filter(&self, filter: &TaskFilter) -> OrchestratorResult<Vec<Task>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT payload FROM chaos_tasks WHERE 1 = 1");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = filter.task_type {
            query.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        if let Some(endpoint_name) = &filter.endpoint_name {
            query
                .push(" AND endpoint_name = ")
                .push_bind(endpoint_name.clone());
        }
        if let Some(after) = filter.updated_after {
            query
                .push(" AND last_updated_ms >= ")
                .push_bind(after.timestamp_millis());
        }
        if let Some(before) = filter.updated_before {
            query
                .push(" AND last_updated_ms <= ")
                .push_bind(before.timestamp_millis());
        }
        query.push(" ORDER BY last_updated_ms DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn find_unfinished(&self) -> OrchestratorResult<Vec<Task>> {
        let rows = sqlx::query("SELECT payload FROM chaos_tasks WHERE status IN (?, ?)")
            .bind(TaskStatus::Initializing.as_str())
            .bind(TaskStatus::InProgress.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }
}
