//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! - `http` - router, middleware, request admission
//! - `fetch` - page retrieval and extraction
//! - `batch` - batch aggregation
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `METAFETCH_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//!
//! CSRF tokens and session ids are never recorded as log fields.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormatSetting, LoggingSection};

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

    /// Build from the `logging` config section. Unknown levels fall back to INFO.
    pub fn from_settings(settings: &LoggingSection) -> Self {
        Self {
            format: match settings.format {
                LogFormatSetting::Json => LogFormat::Json,
                LogFormatSetting::Plaintext => LogFormat::Plaintext,
            },
            output: LogOutput::Stdout,
            default_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
        }
    }

    /// Send output to stderr (keeps stdout clean for CLI results)
    pub fn to_stderr(mut self) -> Self {
        self.output = LogOutput::Stderr;
        self
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

/// Default directive covering the crate's targets at one level
fn default_directive(default_level: Level) -> String {
    format!(
        "{level},http={level},fetch={level},batch={level},config={level}",
        level = default_level.as_str().to_lowercase()
    )
}

/// Build an EnvFilter from METAFETCH_LOG, then RUST_LOG, else the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    build_env_filter_from(default_level, |key| std::env::var(key).ok())
}

fn build_env_filter_from<F>(default_level: Level, lookup: F) -> Result<EnvFilter, LoggingError>
where
    F: Fn(&str) -> Option<String>,
{
    let directive = lookup("METAFETCH_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| default_directive(default_level));
    Ok(EnvFilter::try_new(directive)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(Arc::new(File::create(path)?)),
    })
}

fn build_layer(
    config: &LogConfig,
) -> Result<Box<dyn Layer<Registry> + Send + Sync + 'static>, LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;

    // RFC 3339 timestamp format
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };

    Ok(layer)
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup. Subsequent calls return
/// [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let layer = build_layer(&config)?;
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Initialize logging for tests.
///
/// Plaintext at debug level. Safe to call from many tests; errors from an
/// already-installed subscriber are ignored.
pub fn init_test_logging() {
    let config = LogConfig::development();
    if let Ok(layer) = build_layer(&config) {
        let _ = tracing_subscriber::registry().with(layer).try_init();
    }
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    /// Router, middleware, request admission
    pub const HTTP: &str = "http";
    /// Page retrieval and extraction
    pub const FETCH: &str = "fetch";
    /// Batch aggregation
    pub const BATCH: &str = "batch";
    /// Configuration loading
    pub const CONFIG: &str = "config";
}
