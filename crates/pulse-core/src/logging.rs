use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing_appender::rolling;
use tracing_subscriber::{fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "pulse.log";
const LOG_RETENTION_DAYS: u64 = 7;
const STDOUT_TIME_FORMAT: &str = "%Y/%m/%d - %H:%M:%S";

/// Return the log directory path.
///
/// Precedence: `PULSE_LOG_DIR` env var > platform default.
/// macOS: `~/Library/Logs/pulse/`
/// Linux: `$XDG_DATA_HOME/pulse/logs/` or `~/.local/share/pulse/logs/`
pub fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PULSE_LOG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library").join("Logs").join("pulse");
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Some(data) = dirs::data_dir() {
            return data.join("pulse").join("logs");
        }
    }

    PathBuf::from("logs")
}

/// Remove pulse log files older than `max_age_days` from the given directory.
///
/// Only files named with the rolling appender's `pulse.log` prefix are
/// touched, so a shared log directory keeps its other contents.
fn cleanup_old_logs(log_path: &Path, max_age_days: u64) {
    let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 86400);
    let Ok(entries) = std::fs::read_dir(log_path) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let modified = entry.metadata().and_then(|meta| meta.modified());
        if matches!(modified, Ok(modified) if modified < cutoff) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PULSE_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the logging subsystem.
///
/// Filter controlled by `PULSE_LOG` or `RUST_LOG` (default: `info`).
/// Output: stdout with full local timestamps, plus a daily rotated file in
/// `log_dir()` with 7-day retention. A log directory that cannot be created
/// only disables the file output.
pub fn init() -> Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_timer(ChronoLocal::new(STDOUT_TIME_FORMAT.to_string()))
        .with_target(true);

    let log_path = log_dir();
    let file_layer = match std::fs::create_dir_all(&log_path) {
        Ok(()) => {
            cleanup_old_logs(&log_path, LOG_RETENTION_DAYS);
            let file_appender = rolling::daily(&log_path, LOG_FILE_PREFIX);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        Err(e) => {
            eprintln!("warning: failed to create log directory {log_path:?}: {e}");
            None
        }
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::debug!(dir = %log_path.display(), "logging initialized");
    Ok(())
}
