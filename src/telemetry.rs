//! Structured logging and metrics export.
//!
//! Logging goes through `tracing`; metrics through the `metrics` facade,
//! so any recorder the host application installs receives stage gauges
//! and counters without this crate knowing about the backend.

use std::path::PathBuf;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logging (default for production).
    #[default]
    Json,
    /// Human-readable pretty printing (for development).
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, e.g. "info" or "stage_runtime=debug".
    pub level: String,
    /// Optional file path for log output. If None, logs to stderr.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("failed to open log file: {0}")]
    FileOpen(String),
    #[error("subscriber already initialized")]
    AlreadyInitialized,
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| LogError::InvalidFilter(e.to_string()))?;

    let writer = match &config.output_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LogError::FileOpen(e.to_string()))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(writer))
            .try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)
}

/// Current depth of a stage's event queue.
pub fn record_queue_depth(stage: &str, depth: usize) {
    metrics::gauge!("stage_queue_depth", "stage" => stage.to_string()).set(depth as f64);
}

/// Smoothed service rate of a stage, events per second.
pub fn record_stage_throughput(stage: &str, events_per_sec: f64) {
    metrics::gauge!("stage_throughput", "stage" => stage.to_string()).set(events_per_sec);
}

/// Current worker count of a stage's pool.
pub fn record_pool_size(stage: &str, threads: usize) {
    metrics::gauge!("stage_pool_threads", "stage" => stage.to_string()).set(threads as f64);
}

/// One handler failure (error return or panic).
pub fn record_handler_failure(stage: &str) {
    metrics::counter!("stage_handler_failures", "stage" => stage.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_rejected() {
        let config = LogConfig {
            level: "not==a==filter".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(LogError::InvalidFilter(_))
        ));
    }

    #[test]
    fn log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.log");
        let config = LogConfig {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            output_path: Some(path.clone()),
        };
        // A second init in the same process may race another test's
        // subscriber; only the file side effect is asserted.
        let _ = init_logging(&config);
        assert!(path.exists());
    }

    #[test]
    fn record_helpers_do_not_panic_without_recorder() {
        record_queue_depth("s", 1);
        record_stage_throughput("s", 10.0);
        record_pool_size("s", 2);
        record_handler_failure("s");
    }
}
