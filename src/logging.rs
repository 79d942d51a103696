//! File logging with daily rotation to platform-standard directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use directories::ProjectDirs;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

const LOG_PREFIX: &str = "character-designer";
const RETENTION_DAYS: u64 = 7;

/// Result of initializing the logging system.
pub struct LoggingContext {
    /// Must be held for the application lifetime so buffered lines are flushed.
    pub _guard: WorkerGuard,
    pub session_id: String,
    pub log_directory: PathBuf,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LoggingError {
    pub message: String,
}

/// Generates a 6-character random hex session ID.
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 3] = rng.random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Platform log directory.
///
/// macOS: `~/Library/Logs/character-designer/`, elsewhere the project state
/// directory (falling back to the data directory where no state dir exists).
pub fn log_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        return dirs::home_dir().map(|home| home.join("Library").join("Logs").join(LOG_PREFIX));
    }
    let project_dirs = ProjectDirs::from("dev", LOG_PREFIX, LOG_PREFIX)?;
    Some(
        project_dirs
            .state_dir()
            .unwrap_or_else(|| project_dirs.data_local_dir())
            .to_path_buf(),
    )
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `level`. The returned guard must be held for the
/// application lifetime.
pub fn init(level: &str) -> Result<LoggingContext, LoggingError> {
    let session_id = generate_session_id();

    let log_dir = log_dir().ok_or_else(|| LoggingError {
        message: "Failed to determine log directory".to_string(),
    })?;
    fs::create_dir_all(&log_dir).map_err(|e| LoggingError {
        message: format!("Failed to create log directory: {}", e),
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    info!(session_id = %session_id, "session_start");

    Ok(LoggingContext {
        _guard: guard,
        session_id,
        log_directory: log_dir,
    })
}

/// Deletes rotated log files older than seven days.
///
/// Failures are logged and never prevent startup.
pub fn cleanup_old_logs(log_dir: &Path) {
    let retention = Duration::from_secs(RETENTION_DAYS * 24 * 60 * 60);
    let deleted = remove_logs_older_than(log_dir, retention, SystemTime::now());
    if deleted > 0 {
        debug!(count = deleted, "log_cleanup_completed");
    }
}

fn remove_logs_older_than(log_dir: &Path, retention: Duration, now: SystemTime) -> u32 {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "log_cleanup_read_dir_failed");
            return 0;
        }
    };

    let rotated_prefix = format!("{}.", LOG_PREFIX);
    let mut deleted = 0u32;

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if name.starts_with(&rotated_prefix) => name.to_string(),
            _ => continue,
        };

        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %file_name, error = %e, "log_cleanup_metadata_failed");
                continue;
            }
        };

        // Files dated in the future are skipped
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };

        if age > retention {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(file = %file_name, age_days = age.as_secs() / 86400, "log_file_deleted");
                    deleted += 1;
                }
                Err(e) => warn!(file = %file_name, error = %e, "log_file_delete_failed"),
            }
        }
    }
    deleted
}
