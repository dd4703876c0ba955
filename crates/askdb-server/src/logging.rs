//! Structured logging for the askdb binary
//!
//! Features:
//! - Structured JSON logging for production
//! - Human-readable console logging for development
//! - File rotation with daily log files
//! - Per-run spans (`pipeline_run`, `stage`) carried into every event
//!
//! Console output goes to stderr; stdout is reserved for the answer.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "askdb.log";

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production (structured logging)
    Json,
    /// Compact format for testing
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Log to stderr only
    Stderr,
    /// Log to file only
    File,
    /// Log to both stderr and file
    Both,
}

impl LogOutput {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stderr,
        }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // Keep the noisy HTTP stack quiet unless asked for explicitly
    ["hyper=warn", "reqwest=warn", "h2=warn", "rustls=warn"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(filter, |f, d| f.add_directive(d))
}

fn file_appender(directory: &str) -> RollingFileAppender {
    if let Err(e) = std::fs::create_dir_all(directory) {
        eprintln!("Failed to create log directory {}: {}", directory, e);
    }
    RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE_PREFIX)
}

/// Initialize the global subscriber from configuration
///
/// Configuration keys (each overridable by environment, see `Config::load`):
/// - `level` / `RUST_LOG`: filter directives (e.g. "info", "askdb_pipeline=debug")
/// - `format` / `LOG_FORMAT`: "pretty", "json", "compact"
/// - `output` / `LOG_OUTPUT`: "stderr", "file", "both"
/// - `directory` / `LOG_DIR`: directory for daily log files
pub fn init(config: &LoggingConfig) {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let filter = env_filter(&config.level);

    let console_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    let file_layer = || {
        let appender = file_appender(&config.directory);
        match format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(appender)
                .with_ansi(false)
                .boxed(),
            _ => fmt::layer().with_writer(appender).with_ansi(false).boxed(),
        }
    };

    let console = matches!(output, LogOutput::Stderr | LogOutput::Both).then_some(console_layer);
    let file = matches!(output, LogOutput::File | LogOutput::Both).then(file_layer);

    let initialized = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();

    if initialized.is_err() {
        // A subscriber was already installed (tests, embedding); keep it
        return;
    }

    tracing::debug!(
        format = ?format,
        output = ?output,
        level = %config.level,
        directory = %config.directory,
        "Logging system initialized"
    );
}
