//! Scheduler configuration, loaded from a YAML file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use quarry_protocol::defaults;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub results_cache: ResultsCacheConfig,
    #[serde(default)]
    pub search_scheduler: SearchSchedulerConfig,
}

/// Metadata database coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (e.g. `sqlite:/var/lib/quarry/metadata.db`).
    pub url: String,
}

/// Results cache handed to workers; opaque to the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsCacheConfig {
    pub url: String,
}

/// Scheduler-specific knobs: where reducers connect and how often the
/// controller loops poll the job table.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSchedulerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Poll interval in seconds (float).
    #[serde(default = "default_jobs_poll_delay")]
    pub jobs_poll_delay: f64,
}

impl Default for SearchSchedulerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            jobs_poll_delay: default_jobs_poll_delay(),
        }
    }
}

impl SearchSchedulerConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs_f64(self.jobs_poll_delay)
    }
}

impl SchedulerConfig {
    /// Read and validate a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SchedulerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("database.url must not be empty");
        }
        if self.results_cache.url.is_empty() {
            bail!("results_cache.url must not be empty");
        }
        let delay = self.search_scheduler.jobs_poll_delay;
        if !delay.is_finite() || delay <= 0.0 {
            bail!("search_scheduler.jobs_poll_delay must be a positive number of seconds");
        }
        Ok(())
    }
}

fn default_host() -> String {
    defaults::DEFAULT_REDUCER_HOST.to_string()
}

fn default_port() -> u16 {
    defaults::DEFAULT_REDUCER_PORT
}

fn default_jobs_poll_delay() -> f64 {
    defaults::DEFAULT_JOBS_POLL_DELAY_SECS
}
