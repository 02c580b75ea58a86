//! Shared logging utilities for Quarry binaries.
//!
//! Installs a two-layer tracing subscriber: an append-only log file under
//! the Quarry logs directory plus stderr. `QUARRY_LOGS_DIR` overrides the
//! file location; `QUARRY_LOGGING_LEVEL` overrides the level for both
//! layers (falling back to the standard env filter, then a default).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "quarry_scheduler=info,quarry_protocol=info";

const LOGS_DIR_ENV: &str = "QUARRY_LOGS_DIR";
const LOGGING_LEVEL_ENV: &str = "QUARRY_LOGGING_LEVEL";

/// Logging configuration shared by Quarry binaries.
pub struct LogConfig<'a> {
    /// Base name for the log file (`<app_name>.log`).
    pub app_name: &'a str,
}

/// Initialize tracing with a file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedFileWriter::open(log_dir, config.app_name)
        .context("Failed to open scheduler log file")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(make_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(make_filter()),
        )
        .init();

    Ok(())
}

fn make_filter() -> EnvFilter {
    if let Ok(level) = std::env::var(LOGGING_LEVEL_ENV) {
        if let Ok(filter) = EnvFilter::try_new(level.to_ascii_lowercase()) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Logs directory: `$QUARRY_LOGS_DIR`, else `~/.quarry/logs`.
pub fn logs_dir() -> PathBuf {
    if let Ok(override_path) = std::env::var(LOGS_DIR_ENV) {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quarry")
        .join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

#[derive(Clone)]
struct SharedFileWriter {
    inner: Arc<Mutex<File>>,
}

impl SharedFileWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<Self> {
        let path = dir.join(format!("{}.log", sanitize_name(base_name)));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedFileWriterGuard {
    inner: Arc<Mutex<File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileWriter {
    type Writer = SharedFileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedFileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
