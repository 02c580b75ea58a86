//! Quarry Search Job Scheduler
//!
//! Long-running control plane for archive search: polls the metadata
//! database for pending search jobs, resolves the archives each job must
//! scan, dispatches per-archive tasks to the worker pool, pairs
//! count-aggregated jobs with an external reducer over a framed TCP
//! handshake, and reflects job lifecycle (running, succeeded, failed,
//! cancelled) back into the job table.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod metrics;
pub mod rendezvous;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use db::{JobRow, MetadataStore};
pub use dispatch::{DbTaskQueue, TaskGroupHandle, TaskQueue};
pub use metrics::METRICS;
pub use rendezvous::{ReducerCommand, ReducerOffer};
pub use scheduler::{JobController, SearchScheduler};
