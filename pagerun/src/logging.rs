//! Tracing subscriber setup.
//!
//! Events go to stderr, and additionally to a daily-rolling file when a log
//! directory is given. Filtering follows `RUST_LOG`, `info` by default.

use std::io;
use std::path::Path;
use std::sync::OnceLock;

use pagerun_shared::errors::{PagerunError, PagerunResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "pagerun.log";

/// Flush guard of the file writer; lives as long as the process.
static FILE_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber.
///
/// Only the first call has an effect; later calls return `Ok` without
/// touching the installed subscriber.
///
/// # Errors
///
/// Returns `Storage` if `log_dir` cannot be created.
pub fn init_logging(log_dir: Option<&Path>) -> PagerunResult<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                PagerunError::Storage(format!(
                    "failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    // Lost a race or a subscriber was installed elsewhere; keep the first
    if FILE_GUARD.set(guard).is_err() || !installed {
        return Ok(());
    }

    tracing::debug!(log_dir = ?log_dir, "Logging initialized");
    Ok(())
}
