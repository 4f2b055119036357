use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{FleetError, Result};

const LOG_FILE: &str = "fleetguard.log";

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    if level.is_empty() || level == "info" {
        "info,fleetguard=debug,sqlx=warn".to_string()
    } else {
        format!("{},sqlx=warn", level)
    }
}

/// Check that a rolling appender can create its file in `dir`.
///
/// `tracing_appender::rolling::daily` panics when it cannot open the initial
/// file, so writability has to be established first.
fn log_dir_writable(dir: &str) -> std::result::Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("create {}: {}", dir, e))?;
    let probe = Path::new(dir).join(".fleetguard_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
        .map_err(|e| format!("write {}: {}", dir, e))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file logging is enabled; keep it alive
/// for the life of the process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let mut guard = None;
    let file_layer = match config.dir.as_deref() {
        Some(dir) => match log_dir_writable(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Warning: file logging disabled ({})", e);
                None
            }
        },
        None => None,
    };

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let plain_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| FleetError::Internal(format!("logging already initialised: {}", e)))?;

    if let Some(dir) = config.dir.as_deref().filter(|_| guard.is_some()) {
        tracing::info!(path = %Path::new(dir).join(LOG_FILE).display(), "File logging enabled");
    }
    Ok(guard)
}
