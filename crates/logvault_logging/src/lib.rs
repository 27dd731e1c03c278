//! Shared logging setup for LogVault binaries.
//!
//! Events go to a daily rolling file under `~/.logvault/logs` and to stderr.
//! `RUST_LOG` overrides the default filter for both sinks.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "logvault=info,logvault_scan=info";
const VERBOSE_LOG_FILTER: &str = "logvault=debug,logvault_scan=debug";

/// Logging configuration shared by LogVault binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Only warnings reach stderr; the file still gets the full filter.
    pub quiet_console: bool,
}

/// Initialize tracing with a daily rolling file and stderr output.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the process. Without a usable log directory only
/// stderr is set up and `None` is returned.
pub fn init_logging(config: LogConfig<'_>) -> Result<Option<WorkerGuard>> {
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else if config.quiet_console {
        EnvFilter::new("warn")
    } else {
        file_filter.clone()
    };

    let (file_layer, guard) = match ensure_logs_dir() {
        Ok(dir) => {
            let (writer, guard) = file_writer(&dir, config.app_name);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Warning: file logging disabled: {e:#}");
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(guard)
}

/// Non-blocking writer over `<dir>/<app_name>.log.<date>`
fn file_writer(dir: &Path, app_name: &str) -> (NonBlocking, WorkerGuard) {
    let file_name = format!("{}.log", sanitize_name(app_name));
    let appender = tracing_appender::rolling::daily(dir, file_name);
    tracing_appender::non_blocking(appender)
}

/// Get the LogVault home directory: ~/.logvault
///
/// `LOGVAULT_HOME` takes precedence. Falls back to the working directory when
/// no home directory can be determined.
pub fn logvault_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("LOGVAULT_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".logvault")
}

/// Get the logs directory: ~/.logvault/logs
pub fn logs_dir() -> PathBuf {
    logvault_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
