use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "log";
const LOG_SUFFIX: &str = "txt";

/// Initialize logging to stdout and to a daily file in `logs_dir`.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process.
pub fn init(logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)
        .context("Failed to create log file appender")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

/// Path of the log file written on `date` (UTC).
pub fn log_file_for(logs_dir: &Path, date: NaiveDate) -> PathBuf {
    logs_dir.join(format!(
        "{}.{}.{}",
        LOG_PREFIX,
        date.format("%Y-%m-%d"),
        LOG_SUFFIX
    ))
}

pub fn today_log_file(logs_dir: &Path) -> PathBuf {
    log_file_for(logs_dir, Utc::now().date_naive())
}
