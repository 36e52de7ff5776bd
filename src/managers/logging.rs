//! Logging setup
//!
//! - Console (stderr): text or JSON, level from `LOG_LEVEL` unless `RUST_LOG` is set
//! - File: daily rolling `container-backup.<date>.log` in `LOG_DIR`, when set

use crate::config::{expand_tilde, LogSettings};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

const LOG_PREFIX: &str = "container-backup";
const LOG_SUFFIX: &str = "log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging from the engine's log settings
///
/// Returns a guard that must be kept alive for the duration of the program.
/// When the guard is dropped, any remaining logs are flushed to disk.
pub fn init_logging(settings: &LogSettings) -> Result<LogGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let console: BoxedLayer = if settings.json {
        console.json().with_filter(level_filter(&settings.level)).boxed()
    } else {
        console.with_filter(level_filter(&settings.level)).boxed()
    };
    layers.push(console);

    let mut file_guard = None;
    if let Some(directory) = &settings.directory {
        let log_dir = expand_tilde(directory);
        fs::create_dir_all(&log_dir).with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_PREFIX)
            .filename_suffix(LOG_SUFFIX)
            .build(&log_dir)
            .with_context(|| format!("Failed to open log file in {:?}", log_dir))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        // Files always get at least debug detail
        let file_level = match settings.level.as_str() {
            "trace" => "trace",
            _ => "debug",
        };
        let file = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
        let file: BoxedLayer = if settings.json {
            file.json().with_filter(level_filter(file_level)).boxed()
        } else {
            file.with_filter(level_filter(file_level)).boxed()
        };
        layers.push(file);
        file_guard = Some(guard);

        cleanup_old_logs(&log_dir, settings.max_files)?;
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Logging already initialized")?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Initialize simple console-only logging (before settings are available)
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(level_filter("info"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// `RUST_LOG` wins, otherwise `level` for everything
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn is_log_file(name: &str) -> bool {
    name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX)
}

/// Cleanup old log files, keeping only the most recent N files
fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<()> {
    let mut log_files: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_log_file(&entry.file_name().to_string_lossy()))
        .collect();

    // Sort by modification time (newest first)
    log_files.sort_by(|a, b| {
        let a_time = a.metadata().and_then(|m| m.modified()).ok();
        let b_time = b.metadata().and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });

    for file in log_files.into_iter().skip(max_files as usize) {
        if let Err(e) = fs::remove_file(file.path()) {
            tracing::warn!("Failed to remove old log file {:?}: {}", file.path(), e);
        } else {
            tracing::debug!("Removed old log file: {:?}", file.path());
        }
    }

    Ok(())
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any remaining logs to disk.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}
