//! Task Dispatcher
//!
//! Submits one search task per archive as an atomic group and exposes a
//! join handle over the group. The scheduler only ever talks to the
//! `TaskQueue`/`TaskGroupHandle` traits; the concrete queue here is the
//! task table the worker pool drains with status-guarded claims.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use quarry_protocol::defaults::SEARCH_TASKS_TABLE_NAME;
use quarry_protocol::{JobId, SearchConfig, SearchTaskResult, TaskStatus};

/// External worker task queue, seen from the scheduler.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit one task per archive, in the given order, atomically as a
    /// group. Returns the group's join handle.
    async fn submit(
        &self,
        job_id: JobId,
        archive_ids: &[String],
        config: &SearchConfig,
        results_cache_uri: &str,
    ) -> Result<Box<dyn TaskGroupHandle>>;
}

/// Join handle over one dispatched task group.
#[async_trait]
pub trait TaskGroupHandle: Send {
    /// Whether every task in the group reached a terminal state.
    async fn ready(&mut self) -> Result<bool>;

    /// Collect the per-task results. Only meaningful once `ready()`.
    async fn get(&mut self) -> Result<Vec<SearchTaskResult>>;

    /// Best-effort cancellation. `terminate` also cancels tasks a worker
    /// has already claimed; without it only unclaimed tasks are stopped.
    async fn revoke(&mut self, terminate: bool) -> Result<()>;
}

/// Task queue backed by the `search_tasks` table. Workers claim rows with
/// a conditional UPDATE and write their terminal status back; the
/// scheduler only inserts, probes, and revokes.
pub struct DbTaskQueue {
    pool: SqlitePool,
}

impl DbTaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid task queue URL: {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to task queue: {url}"))?;
        Ok(Self::new(pool))
    }

    /// Create the task table if absent. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {SEARCH_TASKS_TABLE_NAME} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                archive_id TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT {pending},
                search_config BLOB NOT NULL,
                results_cache_uri TEXT NOT NULL,
                submission_time INTEGER NOT NULL
                    DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER))
            )
            "#,
            pending = TaskStatus::Pending.as_i64(),
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {SEARCH_TASKS_TABLE_NAME}_job \
             ON {SEARCH_TASKS_TABLE_NAME} (job_id, status)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for DbTaskQueue {
    async fn submit(
        &self,
        job_id: JobId,
        archive_ids: &[String],
        config: &SearchConfig,
        results_cache_uri: &str,
    ) -> Result<Box<dyn TaskGroupHandle>> {
        let config_blob = config.to_msgpack()?;

        let mut tx = self.pool.begin().await?;
        let mut task_ids = Vec::with_capacity(archive_ids.len());
        for archive_id in archive_ids {
            let result = sqlx::query(&format!(
                "INSERT INTO {SEARCH_TASKS_TABLE_NAME} \
                 (job_id, archive_id, search_config, results_cache_uri) \
                 VALUES (?, ?, ?, ?)"
            ))
            .bind(job_id.as_i64())
            .bind(archive_id)
            .bind(&config_blob)
            .bind(results_cache_uri)
            .execute(&mut *tx)
            .await?;
            task_ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;

        debug!(
            job_id = job_id.as_i64(),
            tasks = task_ids.len(),
            "submitted task group"
        );
        Ok(Box::new(DbTaskGroupHandle {
            pool: self.pool.clone(),
            job_id,
        }))
    }
}

struct DbTaskGroupHandle {
    pool: SqlitePool,
    job_id: JobId,
}

#[async_trait]
impl TaskGroupHandle for DbTaskGroupHandle {
    async fn ready(&mut self) -> Result<bool> {
        let open: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {SEARCH_TASKS_TABLE_NAME} \
             WHERE job_id = ? AND status IN (?, ?)"
        ))
        .bind(self.job_id.as_i64())
        .bind(TaskStatus::Pending.as_i64())
        .bind(TaskStatus::Running.as_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(open == 0)
    }

    async fn get(&mut self) -> Result<Vec<SearchTaskResult>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
            "SELECT id, status FROM {SEARCH_TASKS_TABLE_NAME} \
             WHERE job_id = ? ORDER BY id"
        ))
        .bind(self.job_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(task_id, status)| {
                let status = TaskStatus::try_from(status)
                    .map_err(|e| anyhow!("task {task_id}: {e}"))?;
                Ok(SearchTaskResult {
                    task_id,
                    success: status == TaskStatus::Succeeded,
                })
            })
            .collect()
    }

    async fn revoke(&mut self, terminate: bool) -> Result<()> {
        let sql = if terminate {
            format!(
                "UPDATE {SEARCH_TASKS_TABLE_NAME} SET status = ? \
                 WHERE job_id = ? AND status IN (?, ?)"
            )
        } else {
            format!(
                "UPDATE {SEARCH_TASKS_TABLE_NAME} SET status = ? \
                 WHERE job_id = ? AND status = ?"
            )
        };
        let mut query = sqlx::query(&sql)
            .bind(TaskStatus::Cancelled.as_i64())
            .bind(self.job_id.as_i64())
            .bind(TaskStatus::Pending.as_i64());
        if terminate {
            query = query.bind(TaskStatus::Running.as_i64());
        }
        let revoked = query.execute(&self.pool).await?.rows_affected();
        debug!(
            job_id = self.job_id.as_i64(),
            revoked, terminate, "revoked task group"
        );
        Ok(())
    }
}
