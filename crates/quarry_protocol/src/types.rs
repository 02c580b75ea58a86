//! Canonical job, task, and search-config types.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Canonical job identifier across the platform.
///
/// Backed by `i64` to match the job table's integer identity column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Search job status. The integer codes are stable wire values shared with
/// every collaborator that reads the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum JobStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelling = 4,
    Cancelled = 5,
}

impl JobStatus {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the status DAG. No transition
    /// is reversible; terminal states have no outgoing edges.
    pub fn may_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Succeeded)
                | (Pending, Cancelling)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl TryFrom<i64> for JobStatus {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Succeeded),
            3 => Ok(JobStatus::Failed),
            4 => Ok(JobStatus::Cancelling),
            5 => Ok(JobStatus::Cancelled),
            other => Err(ProtocolError::InvalidJobStatus(other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-archive task status in the worker queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum TaskStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TaskStatus {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl TryFrom<i64> for TaskStatus {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(TaskStatus::Pending),
            1 => Ok(TaskStatus::Running),
            2 => Ok(TaskStatus::Succeeded),
            3 => Ok(TaskStatus::Failed),
            4 => Ok(TaskStatus::Cancelled),
            other => Err(ProtocolError::InvalidTaskStatus(other)),
        }
    }
}

/// Result reported for one per-archive search task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTaskResult {
    pub task_id: i64,
    pub success: bool,
}

/// First frame of a reducer session: where the reducer listens for
/// partial results from the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerHello {
    pub host: String,
    pub port: u16,
}

/// Frame telling the reducer every task result has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerDone {
    pub done: bool,
}

/// Decoded search configuration.
///
/// Only the fields the scheduler acts on are modeled; everything else in
/// the stored blob is preserved in `extra` and forwarded to the workers
/// untouched. `job_id`, `reducer_host`, and `reducer_port` are never
/// present in stored blobs; the scheduler fills them in before dispatching
/// an aggregated job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchConfig {
    pub begin_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    pub count: Option<i64>,
    pub job_id: Option<JobId>,
    pub reducer_host: Option<String>,
    pub reducer_port: Option<u16>,
    /// Opaque pass-through fields (query string, case options, ...).
    pub extra: BTreeMap<String, Value>,
}

impl SearchConfig {
    /// Whether this job requires a reducer for aggregation.
    pub fn needs_reducer(&self) -> bool {
        self.count.is_some()
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let value = rmpv::decode::read_value(&mut Cursor::new(bytes))?;
        Self::from_value(value)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())?;
        Ok(buf)
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Map(entries) = value else {
            return Err(ProtocolError::NotAMap);
        };

        let mut config = SearchConfig::default();
        for (key, value) in entries {
            let key = match key {
                Value::String(s) => s
                    .into_str()
                    .ok_or(ProtocolError::FieldType { field: "map key" })?,
                _ => return Err(ProtocolError::FieldType { field: "map key" }),
            };
            match key.as_str() {
                "begin_timestamp" => config.begin_timestamp = int_field(value, "begin_timestamp")?,
                "end_timestamp" => config.end_timestamp = int_field(value, "end_timestamp")?,
                "count" => config.count = int_field(value, "count")?,
                "job_id" => config.job_id = int_field(value, "job_id")?.map(JobId::new),
                "reducer_host" => config.reducer_host = str_field(value, "reducer_host")?,
                "reducer_port" => config.reducer_port = port_field(value)?,
                _ => {
                    config.extra.insert(key, value);
                }
            }
        }
        Ok(config)
    }

    fn to_value(&self) -> Value {
        let mut entries: Vec<(Value, Value)> = Vec::new();
        if let Some(v) = self.begin_timestamp {
            entries.push((Value::from("begin_timestamp"), Value::from(v)));
        }
        if let Some(v) = self.end_timestamp {
            entries.push((Value::from("end_timestamp"), Value::from(v)));
        }
        if let Some(v) = self.count {
            entries.push((Value::from("count"), Value::from(v)));
        }
        if let Some(v) = self.job_id {
            entries.push((Value::from("job_id"), Value::from(v.as_i64())));
        }
        if let Some(v) = &self.reducer_host {
            entries.push((Value::from("reducer_host"), Value::from(v.as_str())));
        }
        if let Some(v) = self.reducer_port {
            entries.push((Value::from("reducer_port"), Value::from(u64::from(v))));
        }
        for (key, value) in &self.extra {
            entries.push((Value::from(key.as_str()), value.clone()));
        }
        Value::Map(entries)
    }
}

fn int_field(value: Value, field: &'static str) -> Result<Option<i64>> {
    if value.is_nil() {
        return Ok(None);
    }
    value
        .as_i64()
        .map(Some)
        .ok_or(ProtocolError::FieldType { field })
}

fn str_field(value: Value, field: &'static str) -> Result<Option<String>> {
    match value {
        Value::Nil => Ok(None),
        Value::String(s) => s
            .into_str()
            .map(Some)
            .ok_or(ProtocolError::FieldType { field }),
        _ => Err(ProtocolError::FieldType { field }),
    }
}

fn port_field(value: Value) -> Result<Option<u16>> {
    if value.is_nil() {
        return Ok(None);
    }
    value
        .as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .map(Some)
        .ok_or(ProtocolError::FieldType {
            field: "reducer_port",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_map(entries: Vec<(&str, Value)>) -> Vec<u8> {
        let map = Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        );
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &map).unwrap();
        buf
    }

    #[test]
    fn job_status_codes_are_stable() {
        assert_eq!(JobStatus::Pending.as_i64(), 0);
        assert_eq!(JobStatus::Running.as_i64(), 1);
        assert_eq!(JobStatus::Succeeded.as_i64(), 2);
        assert_eq!(JobStatus::Failed.as_i64(), 3);
        assert_eq!(JobStatus::Cancelling.as_i64(), 4);
        assert_eq!(JobStatus::Cancelled.as_i64(), 5);
        for code in 0..=5 {
            assert_eq!(JobStatus::try_from(code).unwrap().as_i64(), code);
        }
        assert!(JobStatus::try_from(6).is_err());
    }

    #[test]
    fn status_dag_has_no_reverse_edges() {
        use JobStatus::*;
        let all = [Pending, Running, Succeeded, Failed, Cancelling, Cancelled];
        for a in all {
            for b in all {
                if a.may_transition_to(b) {
                    assert!(!b.may_transition_to(a), "{a} <-> {b} must not be a cycle");
                }
            }
        }
        for s in [Succeeded, Failed, Cancelled] {
            assert!(s.is_terminal());
            for b in all {
                assert!(!s.may_transition_to(b), "{s} is terminal");
            }
        }
        assert!(Pending.may_transition_to(Running));
        assert!(Pending.may_transition_to(Succeeded));
        assert!(Running.may_transition_to(Failed));
        assert!(Cancelling.may_transition_to(Cancelled));
        assert!(!Pending.may_transition_to(Failed));
        assert!(!Running.may_transition_to(Pending));
    }

    #[test]
    fn decode_minimal_config() {
        let blob = pack_map(vec![
            ("begin_timestamp", Value::from(100)),
            ("end_timestamp", Value::from(200)),
        ]);
        let config = SearchConfig::from_msgpack(&blob).unwrap();
        assert_eq!(config.begin_timestamp, Some(100));
        assert_eq!(config.end_timestamp, Some(200));
        assert_eq!(config.count, None);
        assert!(!config.needs_reducer());
        assert!(config.extra.is_empty());
    }

    #[test]
    fn decode_preserves_unknown_fields() {
        let blob = pack_map(vec![
            ("query_string", Value::from("level=ERROR")),
            ("count", Value::from(50)),
            ("ignore_case", Value::from(true)),
        ]);
        let config = SearchConfig::from_msgpack(&blob).unwrap();
        assert!(config.needs_reducer());
        assert_eq!(
            config.extra.get("query_string"),
            Some(&Value::from("level=ERROR"))
        );
        assert_eq!(config.extra.get("ignore_case"), Some(&Value::from(true)));

        let reencoded = config.to_msgpack().unwrap();
        let decoded = SearchConfig::from_msgpack(&reencoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn nil_fields_decode_as_absent() {
        let blob = pack_map(vec![
            ("begin_timestamp", Value::Nil),
            ("count", Value::Nil),
            ("reducer_host", Value::Nil),
        ]);
        let config = SearchConfig::from_msgpack(&blob).unwrap();
        assert_eq!(config, SearchConfig::default());
    }

    #[test]
    fn enrichment_fields_round_trip() {
        let mut config = SearchConfig {
            count: Some(50),
            ..SearchConfig::default()
        };
        config.job_id = Some(JobId::new(7));
        config.reducer_host = Some("10.0.0.3".to_string());
        config.reducer_port = Some(9001);

        let decoded = SearchConfig::from_msgpack(&config.to_msgpack().unwrap()).unwrap();
        assert_eq!(decoded.job_id, Some(JobId::new(7)));
        assert_eq!(decoded.reducer_host.as_deref(), Some("10.0.0.3"));
        assert_eq!(decoded.reducer_port, Some(9001));
    }

    #[test]
    fn non_map_blob_is_rejected() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from(42)).unwrap();
        assert!(matches!(
            SearchConfig::from_msgpack(&buf),
            Err(ProtocolError::NotAMap)
        ));
    }

    #[test]
    fn mistyped_field_is_rejected() {
        let blob = pack_map(vec![("begin_timestamp", Value::from("yesterday"))]);
        assert!(matches!(
            SearchConfig::from_msgpack(&blob),
            Err(ProtocolError::FieldType { .. })
        ));
    }
}
