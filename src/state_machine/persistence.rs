//! # Task Store
//!
//! Durable task records owned outside the coordinator. The coordinator only
//! reads statuses and applies guarded partial updates through a single
//! compare-and-set keyed by task id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::states::TaskStatus;

/// A long-running task as persisted in the task store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl TaskRecord {
    /// A freshly created task waiting for a worker
    pub fn queued(task_id: impl Into<String>, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Queued,
            owner,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }
}

/// Optional fields written together with a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Error, Debug)]
pub enum TaskStoreError {
    #[error("Task {task_id} already exists")]
    DuplicateTask { task_id: String },

    #[error("Task {task_id} has an unrecognized status in the store: {value}")]
    InvalidStatus { task_id: String, value: String },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task store unavailable: {0}")]
    Unavailable(String),
}

pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// Collaborator interface to the external task store
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a record; fails if the task id is taken
    async fn insert(&self, record: TaskRecord) -> TaskStoreResult<()>;

    async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>>;

    /// Read only the status column
    async fn get_status(&self, task_id: &str) -> TaskStoreResult<Option<TaskStatus>>;

    /// Atomically set `new_status` (plus `update`) if the current status is in
    /// `expected`. Returns whether the write happened.
    async fn compare_and_set_status(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        new_status: TaskStatus,
        update: TaskUpdate,
    ) -> TaskStoreResult<bool>;

    fn store_name(&self) -> &'static str;
}

/// Process-local task store
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> TaskStoreResult<()> {
        match self.tasks.entry(record.task_id.clone()) {
            Entry::Occupied(_) => Err(TaskStoreError::DuplicateTask {
                task_id: record.task_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>> {
        Ok(self.tasks.get(task_id).map(|entry| entry.value().clone()))
    }

    async fn get_status(&self, task_id: &str) -> TaskStoreResult<Option<TaskStatus>> {
        Ok(self.tasks.get(task_id).map(|entry| entry.status))
    }

    async fn compare_and_set_status(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        new_status: TaskStatus,
        update: TaskUpdate,
    ) -> TaskStoreResult<bool> {
        // The shard write lock makes check-and-write one atomic step
        let Some(mut record) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if !expected.contains(&record.status) {
            return Ok(false);
        }

        record.status = new_status;
        record.updated_at = Utc::now();
        if update.result.is_some() {
            record.result = update.result;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        Ok(true)
    }

    fn store_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PgTaskStore;

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};

    const SCHEMA_SQL: &str = include_str!("../../migrations/20250101000000_create_tasker_rpc_tasks.sql");

    /// Postgres-backed task store (`tasker_rpc_tasks`)
    #[derive(Debug, Clone)]
    pub struct PgTaskStore {
        pool: PgPool,
    }

    impl PgTaskStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn connect(database_url: &str, max_connections: u32) -> TaskStoreResult<Self> {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url)
                .await?;
            Ok(Self::new(pool))
        }

        /// Create the task table if it does not exist
        pub async fn ensure_schema(&self) -> TaskStoreResult<()> {
            sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
            Ok(())
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }

        fn parse_status(task_id: &str, value: String) -> TaskStoreResult<TaskStatus> {
            value.parse().map_err(|_| TaskStoreError::InvalidStatus {
                task_id: task_id.to_string(),
                value,
            })
        }
    }

    #[async_trait]
    impl TaskStore for PgTaskStore {
        async fn insert(&self, record: TaskRecord) -> TaskStoreResult<()> {
            let inserted = sqlx::query(
                r#"
                INSERT INTO tasker_rpc_tasks
                    (task_id, status, owner, created_at, updated_at, result, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (task_id) DO NOTHING
                "#,
            )
            .bind(&record.task_id)
            .bind(record.status.as_str())
            .bind(&record.owner)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(&record.result)
            .bind(&record.error)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 0 {
                return Err(TaskStoreError::DuplicateTask {
                    task_id: record.task_id,
                });
            }
            Ok(())
        }

        async fn get(&self, task_id: &str) -> TaskStoreResult<Option<TaskRecord>> {
            let row = sqlx::query(
                r#"
                SELECT task_id, status, owner, created_at, updated_at, result, error
                FROM tasker_rpc_tasks
                WHERE task_id = $1
                "#,
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let status: String = row.try_get("status")?;
            Ok(Some(TaskRecord {
                task_id: row.try_get("task_id")?,
                status: Self::parse_status(task_id, status)?,
                owner: row.try_get("owner")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                result: row.try_get("result")?,
                error: row.try_get("error")?,
            }))
        }

        async fn get_status(&self, task_id: &str) -> TaskStoreResult<Option<TaskStatus>> {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM tasker_rpc_tasks WHERE task_id = $1")
                    .bind(task_id)
                    .fetch_optional(&self.pool)
                    .await?;
            status
                .map(|value| Self::parse_status(task_id, value))
                .transpose()
        }

        async fn compare_and_set_status(
            &self,
            task_id: &str,
            expected: &[TaskStatus],
            new_status: TaskStatus,
            update: TaskUpdate,
        ) -> TaskStoreResult<bool> {
            let expected: Vec<&str> = expected.iter().map(TaskStatus::as_str).collect();
            let updated = sqlx::query(
                r#"
                UPDATE tasker_rpc_tasks
                SET status = $3,
                    updated_at = NOW(),
                    result = COALESCE($4, result),
                    error = COALESCE($5, error)
                WHERE task_id = $1 AND status = ANY($2)
                "#,
            )
            .bind(task_id)
            .bind(&expected)
            .bind(new_status.as_str())
            .bind(&update.result)
            .bind(&update.error)
            .execute(&self.pool)
            .await?;

            Ok(updated.rows_affected() == 1)
        }

        fn store_name(&self) -> &'static str {
            "postgres"
        }
    }
}
