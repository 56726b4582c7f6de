//! Logging system initialization
//!
//! Console output through `tracing-subscriber` with an `EnvFilter`, plus
//! an optional rotating file layer. The non-blocking writer guards are
//! parked globally so file logging keeps flushing for the process
//! lifetime.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Log directory next to the executable, falling back to the working
/// directory.
pub fn default_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    exe_dir.join("logs")
}

/// Initialize logging with default configuration.
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging from configuration. `RUST_LOG` overrides the
/// configured level when set.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let file_layer = if config.file_output {
        let log_dir = config.log_dir.clone().unwrap_or_else(default_log_directory);
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("failed to create log directory {}: {e}", log_dir.display()))?;
        let appender = rolling::daily(&log_dir, "sitefetch.log");
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(guard);
        Some(fmt::layer().with_writer(writer).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}
