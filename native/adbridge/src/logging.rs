use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::Settings;

/// Logs to stderr and to daily-rotated files under `settings.logs_dir`.
///
/// `RUST_LOG` wins over `settings.log_level`. Keep the returned guard alive until exit or the
/// file writer loses its tail.
pub fn setup_logging(settings: &Settings) -> Result<WorkerGuard> {
    fs_err::create_dir_all(&settings.logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("adbridge")
        .filename_suffix("log")
        .build(&settings.logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.log_level)
            .with_context(|| format!("Invalid log level {:?}", settings.log_level))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
