//! Telemetry error types.

use reftrust_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors that can occur while setting up telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Invalid logging configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A global subscriber could not be installed.
    #[error("initialization error: {0}")]
    InitError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

impl Classify for TelemetryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigError(_) => ErrorKind::InvalidInput,
            Self::InitError(_) | Self::IoError(_) => ErrorKind::Internal,
        }
    }
}
