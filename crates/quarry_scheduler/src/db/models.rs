//! Row types for the job table.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use quarry_protocol::{JobId, JobStatus, ProtocolError};

/// One row of the search job table. Status and config are kept raw here
/// and decoded at the point of use, so a bad row surfaces as a per-job
/// error instead of poisoning a whole fetch.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub status: i64,
    /// Epoch milliseconds, defaulted by the store on insert.
    pub submission_time: i64,
    pub search_config: Vec<u8>,
}

impl JobRow {
    pub fn job_id(&self) -> JobId {
        JobId::new(self.id)
    }

    pub fn status(&self) -> Result<JobStatus, ProtocolError> {
        JobStatus::try_from(self.status)
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.submission_time)
    }
}
