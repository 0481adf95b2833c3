//! Logging initialization.
//!
//! Console layer filtered by the configured level, plus an append-only
//! non-blocking file layer under `<data>/logs/`.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::domain::models::LoggingConfig;

/// Initialize tracing. The returned guard must be held for the process
/// lifetime or buffered log lines are lost on exit.
pub fn init(config: &LoggingConfig, logs_dir: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs dir {logs_dir}"))?;

    let appender = tracing_appender::rolling::daily(logs_dir, "manifest.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    let console_layer = if config.format == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
