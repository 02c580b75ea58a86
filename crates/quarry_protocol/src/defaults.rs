//! Canonical default values shared across the scheduler and its tools.

/// Job table written by the search scheduler.
pub const SEARCH_JOBS_TABLE_NAME: &str = "search_jobs";

/// Per-archive task table drained by the worker pool.
pub const SEARCH_TASKS_TABLE_NAME: &str = "search_tasks";

/// Archive metadata table (read-only to the scheduler).
pub const ARCHIVES_TABLE_NAME: &str = "quarry_archives";

/// Upper bound on concurrent reducer offers parked in the rendezvous queue.
/// Additional connections block in their HELLO phase until the queue drains.
pub const REDUCER_QUEUE_CAPACITY: usize = 32;

pub const DEFAULT_REDUCER_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDUCER_PORT: u16 = 7401;

/// Poll interval for both controller loops, in seconds.
pub const DEFAULT_JOBS_POLL_DELAY_SECS: f64 = 0.1;

/// Schema limit on the serialized search config blob.
pub const MAX_SEARCH_CONFIG_SIZE: usize = 60_000;
