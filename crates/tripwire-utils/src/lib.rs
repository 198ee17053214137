//! # Tripwire Utilities
//!
//! Logging setup shared by the `tripwire` CLI and anything else embedding
//! `tripwire-core`. Built on `tracing` and `tracing-subscriber`.

pub mod logging;

pub use logging::{dated_log_file, init_logging, LogFormat, LogLevel, LoggingConfig, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
