//! Logging module for aes128-cli.
//!
//! Structured diagnostics go through `tracing`. User-facing command output
//! is printed directly by the CLI; this module only wires up where the
//! diagnostics end up (stderr, an optional rolling file, text or JSON).

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: WARN)
    pub level: Level,

    /// Whether to log to stderr (default: true)
    pub log_to_stderr: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files
    pub log_dir: PathBuf,

    /// Base filename for log files (default: "aes128-cli")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::WARN,
            log_to_stderr: true,
            log_to_file: false,
            log_dir: PathBuf::from("./logs"),
            log_file_name: "aes128-cli".to_string(),
            json_format: false,
            include_file_line: false,
        }
    }
}

/// Parse a textual level, falling back to WARN for unknown values.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed properly.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // reqwest and friends emit `log` records; route them into tracing
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stderr {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true);

        let stderr_layer = if options.json_format {
            stderr_layer.json().boxed()
        } else {
            stderr_layer.boxed()
        };

        layers.push(stderr_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Set the global subscriber (ignore if already set in this process)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize logging with default options.
pub fn init_default_logging() -> Option<WorkerGuard> {
    init_logging(LogOptions::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tracing::{debug, error, info, trace, warn};

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::WARN);
    }

    #[test]
    fn test_init_logging() {
        let dir = tempdir().unwrap();

        let options = LogOptions {
            level: Level::TRACE,
            log_to_stderr: false,
            log_to_file: true,
            log_dir: dir.path().to_path_buf(),
            log_file_name: "test.log".to_string(),
            ..Default::default()
        };

        let _guard = init_logging(options);

        trace!("This is a trace message");
        debug!("This is a debug message");
        info!("This is an info message");
        warn!("This is a warning message");
        error!("This is an error message");

        // The appender creates its file eagerly
        let entries = fs::read_dir(dir.path()).unwrap();
        assert!(entries.count() > 0);
    }
}
