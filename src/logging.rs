//! Console and file logging
//!
//! Verbosity comes from `RUST_LOG` (default `info`). When a log directory is
//! configured, every line is also appended to `<dir>/eodms-dl.log`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{Error, Result};

/// Log file name inside the log directory
pub const LOG_FILE: &str = "eodms-dl.log";

/// Keeps the file writer alive; dropping it flushes the log file.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
///
/// # Errors
/// Fails when the log directory cannot be created or a subscriber is already set.
pub fn init_logging(log_dir: Option<&Path>) -> Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("cannot install logger: {e}")))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
