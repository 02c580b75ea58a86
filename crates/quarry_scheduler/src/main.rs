//! Quarry search scheduler binary.
//!
//! Usage:
//!     quarry-search-scheduler --config /etc/quarry/scheduler.yaml
//!
//! Exits 0 on shutdown (clean or after an unhealthy loop exit, leaving
//! the restart to the surrounding orchestration) and -1 on configuration
//! or startup failure.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};

use quarry_logging::LogConfig;
use quarry_scheduler::{DbTaskQueue, SchedulerConfig, SearchScheduler};

// Startup failures exit with -1, which the OS reports as 255.
const STARTUP_FAILURE: u8 = 255;

#[derive(Parser, Debug)]
#[command(
    name = "quarry-search-scheduler",
    about = "Wait for and run archive search jobs"
)]
struct Args {
    /// Scheduler configuration file (YAML).
    #[arg(long, short = 'c')]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = quarry_logging::init_logging(LogConfig {
        app_name: "search_scheduler",
    }) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::from(STARTUP_FAILURE);
    }

    let config = match SchedulerConfig::from_yaml_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };
    debug!(
        "Job polling interval {} seconds.",
        config.search_scheduler.jobs_poll_delay
    );

    let task_queue = match DbTaskQueue::connect(&config.database.url).await {
        Ok(queue) => queue,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };
    if let Err(e) = task_queue.init_schema().await {
        error!("{e:#}");
        return ExitCode::from(STARTUP_FAILURE);
    }

    let scheduler = match SearchScheduler::bind(&config, Arc::new(task_queue)).await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(STARTUP_FAILURE);
        }
    };

    // run() logs whichever loop died; the process still exits 0 so the
    // orchestration layer restarts it.
    scheduler.run().await;
    ExitCode::SUCCESS
}
