//! Tracing setup: console output always, optional daily-rolling file.

use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::settings::LogSettings;

/// Keeps the file writer's background thread alive. Dropping it flushes and
/// stops file logging, so hold it for the lifetime of the process.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Racetrix")
        .join("logs")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logger(settings: &LogSettings) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));

    let console_layer = fmt::layer().with_target(false);

    let file_guard = if settings.log_to_file {
        let appender = tracing_appender::rolling::daily(log_dir(), "racetrix.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()?;
        None
    };

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
