//! # Tracing Setup
//!
//! Installs the process-wide `tracing` subscriber used by every binary in the
//! workspace. Output always goes to stderr (stdout is reserved for protocol
//! traffic in the MCP proxy); a plain-text file copy is written when a log
//! directory is configured.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("I/O error while preparing log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Options for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Prefix of the log file name.
    pub app_name: String,
    /// Level used when `RUST_LOG` is not set (trace, debug, info, warn, error).
    pub level: String,
    /// Directory for the log file. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process.
pub fn init_tracing(options: &LogOptions) -> Result<Option<WorkerGuard>, LoggerError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(normalize_level(&options.level))
            .map_err(|_| LoggerError::InvalidFilter(options.level.clone()))?,
    };

    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|source| LoggerError::Io {
                path: dir.clone(),
                source,
            })?;
            prune_old_logs(dir, &options.app_name).map_err(|source| LoggerError::Io {
                path: dir.clone(),
                source,
            })?;

            let file_name = format!(
                "{}_{}.log",
                options.app_name,
                Local::now().format("%Y%m%d_%H%M%S")
            );
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)?;

    Ok(guard)
}

fn normalize_level(level: &str) -> &str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

/// Deletes older log files of `app_name` in `log_dir`, keeping only the newest.
///
/// File names carry a sortable timestamp, so the newest file sorts last.
pub fn prune_old_logs(log_dir: &Path, app_name: &str) -> std::io::Result<usize> {
    let prefix = format!("{}_", app_name);
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().map_or(false, |ext| ext == "log")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.starts_with(&prefix))
        })
        .collect();

    logs.sort();
    logs.reverse();

    let mut removed = 0;
    for old in logs.iter().skip(1) {
        match fs::remove_file(old) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {}: {}", old.display(), e),
        }
    }
    Ok(removed)
}
