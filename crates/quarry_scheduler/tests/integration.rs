//! End-to-end tests for the search scheduler.
//!
//! Each test runs the full supervisor (reducer listener + both controller
//! loops) against a file-backed sqlite database, simulates the worker
//! pool by flipping task rows, and plays the reducer side of the
//! rendezvous protocol over a real TCP connection.

use quarry_protocol::defaults::{
    ARCHIVES_TABLE_NAME, SEARCH_JOBS_TABLE_NAME, SEARCH_TASKS_TABLE_NAME,
};
use quarry_protocol::wire::{self, LENGTH_PREFIX_SIZE};
use quarry_protocol::{JobId, JobStatus, ReducerDone, ReducerHello, SearchConfig, TaskStatus};
use quarry_scheduler::config::{DatabaseConfig, ResultsCacheConfig, SearchSchedulerConfig};
use quarry_scheduler::{DbTaskQueue, SchedulerConfig, SearchScheduler};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Scheduler poll delay used by every test, in seconds.
const POLL_DELAY: f64 = 0.02;
const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    _tmp: TempDir,
    pool: SqlitePool,
    addr: SocketAddr,
}

async fn start_scheduler() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite:{}", tmp.path().join("metadata.db").display());

    let task_queue = DbTaskQueue::connect(&db_url).await.unwrap();
    task_queue.init_schema().await.unwrap();

    let config = SchedulerConfig {
        database: DatabaseConfig {
            url: db_url.clone(),
        },
        results_cache: ResultsCacheConfig {
            url: "redis://127.0.0.1:6379/0".to_string(),
        },
        search_scheduler: SearchSchedulerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            jobs_poll_delay: POLL_DELAY,
        },
    };
    let scheduler = SearchScheduler::bind(&config, Arc::new(task_queue))
        .await
        .unwrap();
    let addr = scheduler.local_addr().unwrap();
    tokio::spawn(scheduler.run());

    let options = SqliteConnectOptions::from_str(&db_url)
        .unwrap()
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {ARCHIVES_TABLE_NAME} (\
         id TEXT PRIMARY KEY, begin_timestamp INTEGER, end_timestamp INTEGER)"
    ))
    .execute(&pool)
    .await
    .unwrap();

    Harness {
        _tmp: tmp,
        pool,
        addr,
    }
}

async fn insert_archive(pool: &SqlitePool, id: &str, begin: i64, end: i64) {
    sqlx::query(&format!("INSERT INTO {ARCHIVES_TABLE_NAME} VALUES (?, ?, ?)"))
        .bind(id)
        .bind(begin)
        .bind(end)
        .execute(pool)
        .await
        .unwrap();
}

async fn insert_job(pool: &SqlitePool, search_config: &[u8]) -> i64 {
    sqlx::query(&format!(
        "INSERT INTO {SEARCH_JOBS_TABLE_NAME} (search_config) VALUES (?)"
    ))
    .bind(search_config)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

async fn job_status(pool: &SqlitePool, job_id: i64) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT status FROM {SEARCH_JOBS_TABLE_NAME} WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn set_job_status(pool: &SqlitePool, job_id: i64, status: JobStatus) {
    sqlx::query(&format!(
        "UPDATE {SEARCH_JOBS_TABLE_NAME} SET status = ? WHERE id = ?"
    ))
    .bind(status.as_i64())
    .bind(job_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn wait_for_status(pool: &SqlitePool, job_id: i64, status: JobStatus) {
    timeout(WAIT, async {
        loop {
            if job_status(pool, job_id).await == status.as_i64() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("job {job_id} never reached {status}");
    });
}

async fn task_rows(pool: &SqlitePool, job_id: i64) -> Vec<(i64, String, i64)> {
    sqlx::query_as(&format!(
        "SELECT id, archive_id, status FROM {SEARCH_TASKS_TABLE_NAME} \
         WHERE job_id = ? ORDER BY id"
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

/// Stand in for the worker pool: drive every task of a job to a terminal
/// status.
async fn finish_tasks(pool: &SqlitePool, job_id: i64, status: TaskStatus) {
    sqlx::query(&format!(
        "UPDATE {SEARCH_TASKS_TABLE_NAME} SET status = ? WHERE job_id = ?"
    ))
    .bind(status.as_i64())
    .bind(job_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    timeout(WAIT, async {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut prefix).await.unwrap();
        let len = wire::read_frame_len(&prefix).unwrap();
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    })
    .await
    .expect("timed out reading frame")
}

async fn connect_reducer(addr: SocketAddr, host: &str, port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let frame = wire::encode_frame(&ReducerHello {
        host: host.to_string(),
        port,
    })
    .unwrap();
    stream.write_all(&frame).await.unwrap();
    stream
}

fn range_config(begin: i64, end: i64) -> Vec<u8> {
    SearchConfig {
        begin_timestamp: Some(begin),
        end_timestamp: Some(end),
        ..SearchConfig::default()
    }
    .to_msgpack()
    .unwrap()
}

fn counted_config(begin: i64, end: i64, count: i64) -> Vec<u8> {
    SearchConfig {
        begin_timestamp: Some(begin),
        end_timestamp: Some(end),
        count: Some(count),
        ..SearchConfig::default()
    }
    .to_msgpack()
    .unwrap()
}

#[tokio::test]
async fn happy_path_without_reducer() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;

    let job_id = insert_job(&h.pool, &range_config(100, 200)).await;
    wait_for_status(&h.pool, job_id, JobStatus::Running).await;

    let tasks = task_rows(&h.pool, job_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].1, "A");

    finish_tasks(&h.pool, job_id, TaskStatus::Succeeded).await;
    wait_for_status(&h.pool, job_id, JobStatus::Succeeded).await;
}

#[tokio::test]
async fn empty_archive_match_succeeds_without_dispatch() {
    let h = start_scheduler().await;

    let job_id = insert_job(&h.pool, &range_config(100, 200)).await;
    wait_for_status(&h.pool, job_id, JobStatus::Succeeded).await;

    assert!(task_rows(&h.pool, job_id).await.is_empty());
}

#[tokio::test]
async fn failed_task_poisons_the_job() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;
    insert_archive(&h.pool, "B", 160, 190).await;

    let job_id = insert_job(&h.pool, &range_config(100, 200)).await;
    wait_for_status(&h.pool, job_id, JobStatus::Running).await;

    let tasks = task_rows(&h.pool, job_id).await;
    assert_eq!(tasks.len(), 2);
    sqlx::query(&format!(
        "UPDATE {SEARCH_TASKS_TABLE_NAME} SET status = ? WHERE id = ?"
    ))
    .bind(TaskStatus::Failed.as_i64())
    .bind(tasks[0].0)
    .execute(&h.pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "UPDATE {SEARCH_TASKS_TABLE_NAME} SET status = ? WHERE id = ?"
    ))
    .bind(TaskStatus::Succeeded.as_i64())
    .bind(tasks[1].0)
    .execute(&h.pool)
    .await
    .unwrap();

    wait_for_status(&h.pool, job_id, JobStatus::Failed).await;
}

#[tokio::test]
async fn cancellation_during_run_revokes_and_cancels() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;

    let job_id = insert_job(&h.pool, &range_config(100, 200)).await;
    wait_for_status(&h.pool, job_id, JobStatus::Running).await;

    set_job_status(&h.pool, job_id, JobStatus::Cancelling).await;
    wait_for_status(&h.pool, job_id, JobStatus::Cancelled).await;

    // The revoke cancelled the dispatched tasks.
    let tasks = task_rows(&h.pool, job_id).await;
    assert!(tasks
        .iter()
        .all(|(_, _, status)| *status == TaskStatus::Cancelled.as_i64()));

    // No later completion tick resurrects the job.
    sleep(Duration::from_secs_f64(POLL_DELAY * 5.0)).await;
    assert_eq!(
        job_status(&h.pool, job_id).await,
        JobStatus::Cancelled.as_i64()
    );
}

#[tokio::test]
async fn aggregated_job_with_clean_reducer_succeeds() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;

    let job_id = insert_job(&h.pool, &counted_config(100, 200, 50)).await;

    let mut reducer = connect_reducer(h.addr, "h", 9).await;
    let assigned = SearchConfig::from_msgpack(&read_frame(&mut reducer).await).unwrap();
    assert_eq!(assigned.job_id, Some(JobId::new(job_id)));
    assert_eq!(assigned.reducer_host.as_deref(), Some("h"));
    assert_eq!(assigned.reducer_port, Some(9));
    assert_eq!(assigned.count, Some(50));

    reducer.write_all(&[0x01]).await.unwrap();
    wait_for_status(&h.pool, job_id, JobStatus::Running).await;

    finish_tasks(&h.pool, job_id, TaskStatus::Succeeded).await;

    let done: ReducerDone = wire::decode_payload(&read_frame(&mut reducer).await).unwrap();
    assert!(done.done);
    reducer.write_all(&[0x01]).await.unwrap();

    wait_for_status(&h.pool, job_id, JobStatus::Succeeded).await;
}

#[tokio::test]
async fn aggregated_job_fails_when_final_ack_is_missing() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;

    let job_id = insert_job(&h.pool, &counted_config(100, 200, 50)).await;

    let mut reducer = connect_reducer(h.addr, "h", 9).await;
    let _ = read_frame(&mut reducer).await;
    reducer.write_all(&[0x01]).await.unwrap();
    wait_for_status(&h.pool, job_id, JobStatus::Running).await;

    finish_tasks(&h.pool, job_id, TaskStatus::Succeeded).await;

    // Read the done frame, then vanish without the final ack.
    let _ = read_frame(&mut reducer).await;
    drop(reducer);

    wait_for_status(&h.pool, job_id, JobStatus::Failed).await;
}

#[tokio::test]
async fn dead_reducer_offer_is_discarded_and_the_next_one_used() {
    let h = start_scheduler().await;
    insert_archive(&h.pool, "A", 150, 180).await;

    let job_id = insert_job(&h.pool, &counted_config(100, 200, 50)).await;

    // First reducer sends HELLO and immediately dies.
    let doomed = connect_reducer(h.addr, "doomed", 1).await;
    drop(doomed);

    // The job must not dispatch off a dead offer.
    sleep(Duration::from_secs_f64(POLL_DELAY * 5.0)).await;
    assert_eq!(
        job_status(&h.pool, job_id).await,
        JobStatus::Pending.as_i64()
    );

    // A healthy reducer arrives and the job proceeds.
    let mut reducer = connect_reducer(h.addr, "healthy", 9).await;
    let assigned = SearchConfig::from_msgpack(&read_frame(&mut reducer).await).unwrap();
    assert_eq!(assigned.reducer_host.as_deref(), Some("healthy"));
    reducer.write_all(&[0x01]).await.unwrap();

    wait_for_status(&h.pool, job_id, JobStatus::Running).await;
}

#[tokio::test]
async fn undecodable_search_config_fails_the_job() {
    let h = start_scheduler().await;

    // 0xc1 is never valid msgpack.
    let job_id = insert_job(&h.pool, &[0xc1, 0x00, 0x01]).await;
    wait_for_status(&h.pool, job_id, JobStatus::Failed).await;
}
