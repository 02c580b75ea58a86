//! Job Controller and supervisor.
//!
//! Two cooperating loops drive every job through the status DAG: the
//! pending loop fetches PENDING rows, resolves archives, pairs aggregated
//! jobs with a reducer, and dispatches task groups; the updates loop
//! reaps cancellations and completions. Each loop owns its own database
//! connection so the two halves never serialize on a shared cursor.
//!
//! Every transition the controller performs is a compare-and-set guarded
//! on the expected prior status. A failed CAS means another actor already
//! moved the row and the local intent is dropped.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use quarry_protocol::defaults::REDUCER_QUEUE_CAPACITY;
use quarry_protocol::{JobId, JobStatus, SearchConfig};

use crate::config::SchedulerConfig;
use crate::db::MetadataStore;
use crate::dispatch::{TaskGroupHandle, TaskQueue};
use crate::metrics::METRICS;
use crate::rendezvous::{self, ReducerCommand, ReducerOffer};

/// In-flight job state. Created when a job transitions to RUNNING,
/// removed when the controller observes a terminal task-group state or a
/// cancellation.
struct ActiveJob {
    task_handle: Box<dyn TaskGroupHandle>,
    reducer_recv: Option<mpsc::Receiver<bool>>,
    reducer_send: Option<mpsc::Sender<ReducerCommand>>,
    /// Set once the reducer reports a failed aggregation. The handshake
    /// runs at most once per job; this keeps its verdict across a
    /// status write that has to be retried.
    reducer_failed: bool,
}

/// The central state machine tying the job table, the worker task queue,
/// and the reducer rendezvous together.
pub struct JobController {
    /// Exactly the set of jobs that are RUNNING from the scheduler's
    /// perspective. Written only by the two controller loops.
    active_jobs: Mutex<HashMap<JobId, ActiveJob>>,
    task_queue: Arc<dyn TaskQueue>,
    results_cache_uri: String,
    poll_delay: Duration,
}

impl JobController {
    pub fn new(
        task_queue: Arc<dyn TaskQueue>,
        results_cache_uri: String,
        poll_delay: Duration,
    ) -> Self {
        Self {
            active_jobs: Mutex::new(HashMap::new()),
            task_queue,
            results_cache_uri,
            poll_delay,
        }
    }

    /// Pending loop: dispatch new jobs. Owns the fetcher connection.
    pub async fn pending_loop(
        &self,
        mut store: MetadataStore,
        mut offers: mpsc::Receiver<ReducerOffer>,
    ) -> Result<()> {
        loop {
            if let Err(e) = self.poll_pending(&mut store, &mut offers).await {
                METRICS.inc_db_errors();
                error!("Pending-jobs pass failed: {e:#}");
            }
            sleep(self.poll_delay).await;
        }
    }

    /// Updates loop: reap cancellations, then completions. Owns the
    /// updater connection. Cancellation runs first so a job that turned
    /// CANCELLING while its tasks finished resolves to CANCELLED.
    pub async fn updates_loop(&self, mut store: MetadataStore) -> Result<()> {
        loop {
            if let Err(e) = self.handle_cancelling_jobs(&mut store).await {
                METRICS.inc_db_errors();
                error!("Cancellation pass failed: {e:#}");
            }
            if let Err(e) = self.check_job_statuses(&mut store).await {
                METRICS.inc_db_errors();
                error!("Completion pass failed: {e:#}");
            }
            sleep(self.poll_delay).await;
        }
    }

    async fn poll_pending(
        &self,
        store: &mut MetadataStore,
        offers: &mut mpsc::Receiver<ReducerOffer>,
    ) -> Result<()> {
        let new_jobs = store.fetch_pending_jobs().await?;

        for row in new_jobs {
            let job_id = row.job_id();
            debug!("Got job {job_id} with status {}.", row.status);

            let mut config = match SearchConfig::from_msgpack(&row.search_config) {
                Ok(config) => config,
                Err(e) => {
                    error!("Job {job_id} has an undecodable search config: {e}; failing it.");
                    store
                        .set_job_status(job_id, JobStatus::Failed, Some(JobStatus::Pending))
                        .await?;
                    METRICS.inc_jobs_failed();
                    continue;
                }
            };

            let archives = store.archives_for_search(&config).await?;
            if archives.is_empty() {
                if store
                    .set_job_status(job_id, JobStatus::Succeeded, Some(JobStatus::Pending))
                    .await?
                {
                    info!("No matching archives, skipping job {job_id}.");
                }
                continue;
            }

            let mut reducer_recv = None;
            let mut reducer_send = None;
            if config.needs_reducer() {
                config.job_id = Some(job_id);
                let (recv, send) = self.acquire_reducer(offers, &mut config).await?;
                reducer_recv = Some(recv);
                reducer_send = Some(send);
            }

            let task_handle = self
                .task_queue
                .submit(job_id, &archives, &config, &self.results_cache_uri)
                .await?;
            self.active_jobs.lock().await.insert(
                job_id,
                ActiveJob {
                    task_handle,
                    reducer_recv,
                    reducer_send,
                    reducer_failed: false,
                },
            );

            if store
                .set_job_status(job_id, JobStatus::Running, Some(JobStatus::Pending))
                .await?
            {
                info!(
                    "Dispatched job {job_id} with {} archives to search.",
                    archives.len()
                );
                METRICS.inc_jobs_dispatched();
            } else {
                // The row moved (likely to CANCELLING) between the fetch
                // and here. The entry stays in the map so the updates loop
                // reaps it; its terminal CAS is guarded on RUNNING and
                // will no-op against the moved row.
                warn!("Job {job_id} changed status before dispatch completed.");
            }
        }
        Ok(())
    }

    /// Pull offers until a reducer accepts the assignment. Offers whose
    /// session died during the handshake are discarded. Blocks on the
    /// rendezvous queue when no reducer is connected.
    async fn acquire_reducer(
        &self,
        offers: &mut mpsc::Receiver<ReducerOffer>,
        config: &mut SearchConfig,
    ) -> Result<(mpsc::Receiver<bool>, mpsc::Sender<ReducerCommand>)> {
        loop {
            let Some(mut offer) = offers.recv().await else {
                bail!("reducer rendezvous queue closed");
            };

            config.reducer_host = Some(offer.host.clone());
            config.reducer_port = Some(offer.port);

            if offer
                .send
                .send(ReducerCommand::Assign(config.clone()))
                .await
                .is_err()
            {
                METRICS.inc_reducer_offers_discarded();
                continue;
            }
            match offer.recv.recv().await {
                Some(true) => {
                    let job_id = config.job_id.unwrap_or_default();
                    info!(
                        "Got reducer for job {job_id} at {}:{}",
                        offer.host, offer.port
                    );
                    return Ok((offer.recv, offer.send));
                }
                _ => {
                    METRICS.inc_reducer_offers_discarded();
                }
            }
        }
    }

    async fn handle_cancelling_jobs(&self, store: &mut MetadataStore) -> Result<()> {
        let cancelling = store.fetch_cancelling_jobs().await?;

        for job_id in cancelling {
            // Local cleanup runs before the CANCELLED write so nobody can
            // observe CANCELLED alongside still-queued tasks. The entry
            // stays in the map until the write lands, so a transient
            // gateway error leaves the job to be reaped again next tick.
            {
                let mut jobs = self.active_jobs.lock().await;
                if let Some(job) = jobs.get_mut(&job_id) {
                    // Best effort: the group may be mid-flight or done.
                    let _ = job.task_handle.revoke(true).await;
                    let _ = job.task_handle.get().await;
                    if let Some(send) = &job.reducer_send {
                        let _ = send.send(ReducerCommand::Abort).await;
                    }
                }
            }
            match store
                .set_job_status(job_id, JobStatus::Cancelled, Some(JobStatus::Cancelling))
                .await
            {
                Ok(changed) => {
                    self.active_jobs.lock().await.remove(&job_id);
                    if changed {
                        info!("Cancelled job {job_id}.");
                        METRICS.inc_jobs_cancelled();
                    } else {
                        error!("Failed to cancel job {job_id}.");
                    }
                }
                Err(e) => {
                    METRICS.inc_db_errors();
                    error!("Failed to record cancellation of job {job_id}: {e:#}; will retry.");
                }
            }
        }
        Ok(())
    }

    async fn check_job_statuses(&self, store: &mut MetadataStore) -> Result<()> {
        let mut jobs = self.active_jobs.lock().await;
        let job_ids: Vec<JobId> = jobs.keys().copied().collect();

        for job_id in job_ids {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };

            let outcome = match job.task_handle.ready().await {
                Err(e) => Err(e),
                Ok(false) => continue,
                Ok(true) => job.task_handle.get().await,
            };

            // The map entry is dropped only after the status write lands:
            // a transient gateway error keeps the job in the map so the
            // next tick retries the write instead of orphaning a RUNNING
            // row nobody polls anymore.
            match outcome {
                Err(e) => {
                    error!("Job {job_id} failed: {e:#}.");
                    match store
                        .set_job_status(job_id, JobStatus::Failed, Some(JobStatus::Running))
                        .await
                    {
                        Ok(_) => {
                            if let Some(job) = jobs.remove(&job_id) {
                                if let Some(send) = &job.reducer_send {
                                    let _ = send.send(ReducerCommand::Abort).await;
                                }
                            }
                            METRICS.inc_jobs_failed();
                        }
                        Err(e) => {
                            METRICS.inc_db_errors();
                            error!(
                                "Failed to record failure of job {job_id}: {e:#}; will retry."
                            );
                        }
                    }
                }
                Ok(results) => {
                    let mut new_status = JobStatus::Succeeded;
                    for result in &results {
                        if !result.success {
                            new_status = JobStatus::Failed;
                            debug!("Task {} of job {job_id} failed.", result.task_id);
                        }
                    }

                    let Some(job) = jobs.get_mut(&job_id) else {
                        continue;
                    };
                    if let Some(send) = job.reducer_send.take() {
                        // Tell the reducer every task result is in, then
                        // wait for its verdict on the aggregation. Taking
                        // the handles keeps the exchange single-shot even
                        // if the status write below has to be retried.
                        let _ = send.send(ReducerCommand::Finish).await;
                        let acked = match job.reducer_recv.take().as_mut() {
                            Some(recv) => recv.recv().await.unwrap_or(false),
                            None => false,
                        };
                        if !acked {
                            job.reducer_failed = true;
                        }
                    }
                    if job.reducer_failed {
                        new_status = JobStatus::Failed;
                    }

                    match store
                        .set_job_status(job_id, new_status, Some(JobStatus::Running))
                        .await
                    {
                        Ok(changed) => {
                            jobs.remove(&job_id);
                            if changed {
                                if new_status == JobStatus::Failed {
                                    info!("Completed job {job_id} with failing tasks.");
                                    METRICS.inc_jobs_failed();
                                } else {
                                    info!("Completed job {job_id}.");
                                    METRICS.inc_jobs_completed();
                                }
                            }
                        }
                        Err(e) => {
                            METRICS.inc_db_errors();
                            error!(
                                "Failed to record completion of job {job_id}: {e:#}; will retry."
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Supervisor: owns the listener and the two loop connections, runs all
/// three tasks with first-to-finish semantics. Any exit is unhealthy; the
/// surrounding orchestration is expected to restart the process.
pub struct SearchScheduler {
    listener: TcpListener,
    fetcher: MetadataStore,
    updater: MetadataStore,
    controller: JobController,
}

impl SearchScheduler {
    /// Perform all fallible startup: bind the reducer listener and open
    /// the two loop connections.
    pub async fn bind(config: &SchedulerConfig, task_queue: Arc<dyn TaskQueue>) -> Result<Self> {
        let mut fetcher = MetadataStore::connect(&config.database.url).await?;
        fetcher.init_schema().await?;
        let mut updater = MetadataStore::connect(&config.database.url).await?;
        updater.ping().await?;
        info!("Connected to metadata database at {}.", config.database.url);

        let listener = TcpListener::bind((
            config.search_scheduler.host.as_str(),
            config.search_scheduler.port,
        ))
        .await
        .with_context(|| {
            format!(
                "Failed to bind reducer listener on {}:{}",
                config.search_scheduler.host, config.search_scheduler.port
            )
        })?;
        info!("Reducer rendezvous listening on {}.", listener.local_addr()?);

        let controller = JobController::new(
            task_queue,
            config.results_cache.url.clone(),
            config.search_scheduler.poll_delay(),
        );
        Ok(Self {
            listener,
            fetcher,
            updater,
            controller,
        })
    }

    /// Address the reducer listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Drive the accept loop and both controller loops until the first of
    /// them exits, then log the cause and return for a clean process exit.
    pub async fn run(self) {
        let Self {
            listener,
            fetcher,
            updater,
            controller,
        } = self;
        let (offers_tx, offers_rx) = mpsc::channel(REDUCER_QUEUE_CAPACITY);

        info!("Search scheduler started.");
        tokio::select! {
            result = rendezvous::serve(listener, offers_tx) => {
                log_exit("Reducer listener", result);
            }
            result = controller.pending_loop(fetcher, offers_rx) => {
                log_exit("Pending-jobs loop", result);
            }
            result = controller.updates_loop(updater) => {
                log_exit("Job-updates loop", result);
            }
        }
    }
}

fn log_exit(component: &str, result: Result<()>) {
    match result {
        Ok(()) => error!("{component} exited unexpectedly."),
        Err(e) => error!("{component} failed: {e:#}."),
    }
}
