use std::fs;
use std::path::Path;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{DeployError, Result};

static INIT: Once = Once::new();
const MAX_LOG_FILES: usize = 7; // Keep 7 days of logs
const LOG_PREFIX: &str = "stargate-deploy";

/// Install the global subscriber: a console layer and, when a directory is
/// configured, a daily-rotated JSON file. `RUST_LOG` overrides `level`.
/// Only the first call has any effect.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = install(config);
    });
    result
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn install(config: &LoggingConfig) -> Result<()> {
    let console = fmt::Layer::new()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter(&config.level));

    let file = match &config.directory {
        Some(log_dir) => {
            fs::create_dir_all(log_dir)?;
            cleanup_old_logs(log_dir);

            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| DeployError::config(format!("Failed to create log file appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| DeployError::config(format!("Failed to set tracing subscriber: {}", e)))
}

fn cleanup_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_PREFIX))
        .collect();

    // Newest first
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    for old_file in log_files.iter().skip(MAX_LOG_FILES) {
        let _ = fs::remove_file(old_file.path());
    }
}
