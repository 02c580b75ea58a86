//! In-memory counters for scheduler health.
//!
//! Lock-free atomics, single global instance. Informational only; there
//! is no exporter wired up.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub jobs_dispatched: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub reducers_assigned: AtomicU64,
    pub reducer_offers_discarded: AtomicU64,
    pub db_errors: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_dispatched: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            reducers_assigned: AtomicU64::new(0),
            reducer_offers_discarded: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reducers_assigned(&self) {
        self.reducers_assigned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reducer_offers_discarded(&self) {
        self.reducer_offers_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_db_errors(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
