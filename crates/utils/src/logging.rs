//! provides logging helpers

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// When set, logs are additionally written to a daily rolling file at this path.
pub const LOG_PATH_ENV_VAR: &str = "FPGA_LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// The returned guard must be held for the lifetime of the process when a
/// log file is configured, otherwise buffered lines are lost on exit.
pub fn init() -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some((writer, guard)) = env::var(LOG_PATH_ENV_VAR)
        .ok()
        .filter(|path| !path.is_empty())
        .and_then(|path| file_writer(Path::new(&path)))
    else {
        registry().with(stderr_layer).init();
        return None;
    };

    let file_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter());
    registry().with(stderr_layer).with(file_layer).init();
    Some(guard)
}

fn file_writer(
    path: &Path,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    let prefix = path.file_name()?.to_str()?;

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(directory)
    {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            eprintln!("failed to create log file appender at {}: {e}", path.display());
            None
        }
    }
}
