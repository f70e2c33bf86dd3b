//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `bot` - startup, shutdown, long-poll intake
//! - `governor` - concurrency slots and sweeps
//! - `fetch` - content extraction tiers
//! - `transfer` - media downloads
//! - `pipeline` - per-link delivery runs
//! - `telegram` - Bot API calls
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `CLIPFERRY_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//!
//! # Examples
//!
//! ```no_run
//! use clipferry::logging::{init_logging, LogConfig, LogFormat, LogOutput};
//!
//! // Development setup (plaintext to stdout)
//! init_logging(LogConfig::development()).unwrap();
//!
//! // Production setup (JSON to stdout)
//! init_logging(LogConfig::production()).unwrap();
//!
//! // Custom setup with file output
//! init_logging(LogConfig {
//!     format: LogFormat::Json,
//!     output: LogOutput::File("/var/log/clipferry.log".into()),
//!     default_level: tracing::Level::INFO,
//! }).unwrap();
//! ```

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Write to stdout
    #[default]
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Output destination (stdout, stderr, or file)
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Create a development configuration (plaintext to stdout, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// Create a production configuration (JSON to stdout, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks CLIPFERRY_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    // Check CLIPFERRY_LOG first, then RUST_LOG
    if let Ok(filter) = std::env::var("CLIPFERRY_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    // Default filter with standard targets
    let default_filter = format!(
        "{level},bot={level},governor={level},fetch={level},transfer={level},pipeline={level},telegram={level},config={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

/// Initialize the logging subsystem with the given configuration.
///
/// This function should be called once at application startup. Subsequent calls
/// will return an error.
///
/// # Errors
///
/// Returns an error if:
/// - Logging has already been initialized
/// - The log file cannot be created (for file output)
/// - The environment filter is invalid
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    // Prevent double initialization
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;

    // RFC 3339 timestamp format
    let timer = UtcTime::rfc_3339();

    match (&config.format, &config.output) {
        (LogFormat::Json, LogOutput::Stdout) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stdout)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
        (LogFormat::Json, LogOutput::Stderr) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stderr)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
        (LogFormat::Json, LogOutput::File(path)) => {
            let file = Arc::new(File::create(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(file)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
        (LogFormat::Plaintext, LogOutput::Stdout) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(io::stdout)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
        (LogFormat::Plaintext, LogOutput::Stderr) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(io::stderr)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
        (LogFormat::Plaintext, LogOutput::File(path)) => {
            let file = Arc::new(File::create(path)?);
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(file)
                .with_filter(filter);

            tracing_subscriber::registry().with(layer).init();
        }
    }

    Ok(())
}

/// Initialize logging for tests.
///
/// This is a convenience function that initializes logging with test-friendly
/// defaults (plaintext, debug level). It silently ignores errors if logging
/// is already initialized, making it safe to call from multiple tests.
pub fn init_test_logging() {
    let _ = init_logging_internal(LogConfig {
        format: LogFormat::Plaintext,
        output: LogOutput::Stdout,
        default_level: Level::DEBUG,
    });
}

/// Internal initialization that doesn't check the guard (for testing)
fn init_logging_internal(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let timer = UtcTime::rfc_3339();

    let subscriber = tracing_subscriber::registry();

    match (&config.format, &config.output) {
        (LogFormat::Json, LogOutput::Stdout) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stdout)
                .with_filter(filter);

            subscriber.with(layer).try_init()?;
        }
        _ => {
            // For testing, just use stdout plaintext
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_writer(io::stdout)
                .with_filter(filter);

            subscriber.with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    /// Startup, shutdown, long-poll intake
    pub const BOT: &str = "bot";
    /// Concurrency slots and sweeps
    pub const GOVERNOR: &str = "governor";
    /// Content extraction tiers
    pub const FETCH: &str = "fetch";
    /// Media downloads
    pub const TRANSFER: &str = "transfer";
    /// Per-link delivery runs
    pub const PIPELINE: &str = "pipeline";
    /// Bot API calls
    pub const TELEGRAM: &str = "telegram";
    /// Configuration loading
    pub const CONFIG: &str = "config";
}
