use crate::cli_config::LogFormat;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::Layer as _;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// Logging Setup
// =============================================================================

/// `debug_mode` forces the `debug` level whatever `log_level` says.
pub fn effective_level(log_level: &str, debug_mode: bool) -> &str {
    if debug_mode { "debug" } else { log_level }
}

pub fn setup_logging(log_dir: &Path, log_level: &str, format: LogFormat) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "dkrmgr.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let json = format == LogFormat::Json;

    let text_layers = (!json).then(|| {
        let stdout = fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);
        let file = fmt::Layer::new()
            .with_writer(non_blocking_appender.clone())
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(false);
        stdout.and_then(file)
    });

    let json_layers = json.then(|| {
        let stdout = fmt::Layer::new()
            .json()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_current_span(false);
        let file = fmt::Layer::new()
            .json()
            .with_writer(non_blocking_appender)
            .with_target(false)
            .with_current_span(false);
        stdout.and_then(file)
    });

    tracing_subscriber::registry()
        .with(EnvFilter::new(format!("dkrmgr={}", log_level)))
        .with(text_layers)
        .with(json_layers)
        .init();

    Ok(guard)
}
