//! # Logging
//!
//! Console and optional file logging through `tracing`.
//!
//! Console output goes to stderr so that stdout stays free for hit reports.
//! File output rolls daily through `tracing-appender` and is written from a
//! background worker; keep the returned [`LoggingGuard`] alive until exit or
//! the tail of the log is lost.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tripwire_utils::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::from_env()).expect("Failed to initialize logging");
//! tracing::info!("Watching");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g. `debug`, `tripwire_core=trace`)
//! - `TRIPWIRE_LOG_FORMAT`: `pretty` (default) or `json`
//! - `TRIPWIRE_LOG_FILE`: also write to this file (rolled daily)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt as std_fmt, io};

use chrono::Local;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const FORMAT_ENV: &str = "TRIPWIRE_LOG_FORMAT";
/// Environment variable naming a log file
pub const FILE_ENV: &str = "TRIPWIRE_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

impl std_fmt::Display for LogLevel
{
    fn fmt(&self, f: &mut std_fmt::Formatter<'_>) -> std_fmt::Result
    {
        write!(f, "{}", Level::from(*self))
    }
}

/// Where and how to log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig
{
    /// Overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// Additional log file
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Read `TRIPWIRE_LOG_FORMAT` and `TRIPWIRE_LOG_FILE`
    ///
    /// An unparseable format falls back to pretty.
    #[must_use]
    pub fn from_env() -> Self
    {
        Self {
            level: None,
            format: env::var(FORMAT_ENV)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            file: env::var_os(FILE_ENV).map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }

    /// Filter directives in effect: explicit level, then `RUST_LOG`, then `info`
    #[must_use]
    pub fn directives(&self) -> String
    {
        match self.level {
            Some(level) => level.to_string().to_lowercase(),
            None => env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_string()),
        }
    }

    fn filter(&self) -> EnvFilter
    {
        EnvFilter::try_new(self.directives()).unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    }
}

/// Keeps the file writer alive; dropping it flushes the log file.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

fn layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);

    match format {
        LogFormat::Pretty => base.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

/// Install the global subscriber described by `config`
///
/// ## Errors
///
/// - `InitializationFailed`: a global subscriber is already installed
/// - `FileError`: the log file's directory could not be created
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![layer(config.format, io::stderr, true, config.filter())];

    let mut file_guard = None;
    if let Some(path) = &config.file {
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(directory)?;
        let appender = tracing_appender::rolling::daily(directory, path.file_name().unwrap_or_default());
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(layer(config.format, writer, false, config.filter()));
        file_guard = Some(guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}

/// `<dir>/<YYYY-MM-DD>-tripwire.log` for today (local time)
#[must_use]
pub fn dated_log_file(directory: &Path) -> PathBuf
{
    directory.join(format!("{}-tripwire.log", Local::now().format("%Y-%m-%d")))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Invalid log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    #[error("Invalid log level: {0} (use 'error', 'warn', 'info', 'debug' or 'trace')")]
    InvalidLevel(String),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("Trace").unwrap(), LogLevel::Trace);
        assert!(matches!(LogLevel::from_str("loud"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_explicit_level_wins()
    {
        let config = LoggingConfig::default().with_level(LogLevel::Debug);
        assert_eq!(config.directives(), "debug");
    }

    #[test]
    fn test_builders()
    {
        let config = LoggingConfig::default()
            .with_format(LogFormat::Json)
            .with_file("logs/watch.log");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("logs/watch.log")));
        assert_eq!(config.level, None);
    }

    #[test]
    fn test_dated_log_file()
    {
        let path = dated_log_file(Path::new("/var/log"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-tripwire.log"));
        assert_eq!(name.len(), "YYYY-MM-DD-tripwire.log".len());
        assert_eq!(path.parent(), Some(Path::new("/var/log")));
    }
}
