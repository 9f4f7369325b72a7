//! Configuration error types.

use std::io;

use reftrust_core::{Classify, ErrorKind};
use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        /// Path of the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A config file is not valid TOML or does not match the schema.
    #[error("failed to parse config file at {path}: {source}")]
    ParseError {
        /// Path of the file.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("validation error in field '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An environment variable has an unusable value.
    #[error("environment variable '{var_name}': {message}")]
    EnvError {
        /// Variable name.
        var_name: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ReadError { .. } => ErrorKind::Internal,
            Self::ParseError { .. } | Self::ValidationError { .. } | Self::EnvError { .. } => {
                ErrorKind::InvalidInput
            },
        }
    }
}
