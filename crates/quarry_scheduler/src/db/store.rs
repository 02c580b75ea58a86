//! Job Store Gateway
//!
//! Typed reads/writes against the job table plus the archive-metadata
//! filter query. Every status transition goes through a conditional
//! UPDATE guarded on the expected prior status, so a lost race shows up
//! as `false` rather than a clobbered row.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, ConnectOptions, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use quarry_protocol::defaults::{
    ARCHIVES_TABLE_NAME, MAX_SEARCH_CONFIG_SIZE, SEARCH_JOBS_TABLE_NAME,
};
use quarry_protocol::{JobId, JobStatus, SearchConfig};

use super::models::JobRow;

/// Extra column value applied atomically with a status transition.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Int(i64),
    Text(String),
}

/// Gateway over the metadata database.
///
/// Each instance owns a dedicated connection. The controller creates one
/// per loop so the pending path and the update path never serialize on a
/// shared cursor.
pub struct MetadataStore {
    conn: SqliteConnection,
}

impl MetadataStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let conn = options
            .connect()
            .await
            .with_context(|| format!("Failed to connect to metadata database: {url}"))?;
        Ok(Self { conn })
    }

    /// Create the job table and its status index if absent. Idempotent.
    pub async fn init_schema(&mut self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {SEARCH_JOBS_TABLE_NAME} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL DEFAULT {pending},
                submission_time INTEGER NOT NULL
                    DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)),
                search_config BLOB NOT NULL
            )
            "#,
            pending = JobStatus::Pending.as_i64(),
        ))
        .execute(&mut self.conn)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {SEARCH_JOBS_TABLE_NAME}_status \
             ON {SEARCH_JOBS_TABLE_NAME} (status)"
        ))
        .execute(&mut self.conn)
        .await?;

        Ok(())
    }

    /// Insert a new job with a serialized search config. The status and
    /// submission time take their column defaults.
    pub async fn submit_job(&mut self, search_config: &[u8]) -> Result<JobId> {
        if search_config.len() > MAX_SEARCH_CONFIG_SIZE {
            bail!(
                "search config blob is {} bytes; the job table caps it at {}",
                search_config.len(),
                MAX_SEARCH_CONFIG_SIZE
            );
        }
        let result = sqlx::query(&format!(
            "INSERT INTO {SEARCH_JOBS_TABLE_NAME} (search_config) VALUES (?)"
        ))
        .bind(search_config)
        .execute(&mut self.conn)
        .await?;
        Ok(JobId::new(result.last_insert_rowid()))
    }

    /// Every job currently awaiting dispatch.
    pub async fn fetch_pending_jobs(&mut self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT id, status, submission_time, search_config \
             FROM {SEARCH_JOBS_TABLE_NAME} WHERE status = ?"
        ))
        .bind(JobStatus::Pending.as_i64())
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows)
    }

    /// Ids of every job an operator has asked to cancel.
    pub async fn fetch_cancelling_jobs(&mut self) -> Result<Vec<JobId>> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {SEARCH_JOBS_TABLE_NAME} WHERE status = ?"
        ))
        .bind(JobStatus::Cancelling.as_i64())
        .fetch_all(&mut self.conn)
        .await?;
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    /// Compare-and-set status transition. When `prev` is given the UPDATE
    /// matches on `id AND status = prev`; returns true iff exactly one row
    /// changed. A `false` means some other actor already moved the row and
    /// the caller's intent must be dropped.
    pub async fn set_job_status(
        &mut self,
        job_id: JobId,
        new: JobStatus,
        prev: Option<JobStatus>,
    ) -> Result<bool> {
        self.set_job_status_with(job_id, new, prev, &[]).await
    }

    /// [`set_job_status`](Self::set_job_status) with extra columns written
    /// in the same statement, atomically with the transition. Column names
    /// come from calling code, never from user input.
    pub async fn set_job_status_with(
        &mut self,
        job_id: JobId,
        new: JobStatus,
        prev: Option<JobStatus>,
        extra: &[(&str, SqlParam)],
    ) -> Result<bool> {
        let mut sql = format!("UPDATE {SEARCH_JOBS_TABLE_NAME} SET status = ?");
        for (column, _) in extra {
            sql.push_str(&format!(", {column} = ?"));
        }
        sql.push_str(" WHERE id = ?");
        if prev.is_some() {
            sql.push_str(" AND status = ?");
        }

        let mut query = sqlx::query(&sql).bind(new.as_i64());
        for (_, value) in extra {
            query = match value {
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }
        query = query.bind(job_id.as_i64());
        if let Some(prev) = prev {
            query = query.bind(prev.as_i64());
        }

        let changed = query.execute(&mut self.conn).await?.rows_affected() == 1;
        debug!(
            job_id = job_id.as_i64(),
            new = new.as_str(),
            prev = prev.map(JobStatus::as_str),
            changed,
            "status transition"
        );
        Ok(changed)
    }

    /// Current status of one job.
    pub async fn get_job_status(&mut self, job_id: JobId) -> Result<JobStatus> {
        let code: i64 = sqlx::query_scalar(&format!(
            "SELECT status FROM {SEARCH_JOBS_TABLE_NAME} WHERE id = ?"
        ))
        .bind(job_id.as_i64())
        .fetch_one(&mut self.conn)
        .await?;
        JobStatus::try_from(code).map_err(Into::into)
    }

    /// Archive Resolver: ids of every archive overlapping the config's
    /// time range, newest first, so workers examine recent data before
    /// old. Absent bounds select everything.
    pub async fn archives_for_search(&mut self, config: &SearchConfig) -> Result<Vec<String>> {
        let mut sql = format!("SELECT id FROM {ARCHIVES_TABLE_NAME}");
        let mut filter_clauses = Vec::new();
        if config.end_timestamp.is_some() {
            filter_clauses.push("begin_timestamp <= ?");
        }
        if config.begin_timestamp.is_some() {
            filter_clauses.push("end_timestamp >= ?");
        }
        if !filter_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter_clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY end_timestamp DESC");

        let mut query = sqlx::query_scalar(&sql);
        if let Some(end) = config.end_timestamp {
            query = query.bind(end);
        }
        if let Some(begin) = config.begin_timestamp {
            query = query.bind(begin);
        }
        let archives: Vec<String> = query.fetch_all(&mut self.conn).await?;
        Ok(archives)
    }

    /// Ping the connection; used at startup to fail fast on a bad URL.
    pub async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}
