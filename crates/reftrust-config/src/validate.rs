//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const FORMATS: [&str; 4] = ["pretty", "compact", "json", "full"];

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_logging(config)?;
    validate_repository(config)?;
    Ok(())
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message,
    }
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let logging = &config.logging;
    if !LEVELS.contains(&logging.level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported log level '{}'; expected one of: {}",
                logging.level,
                LEVELS.join(", ")
            ),
        ));
    }
    if !FORMATS.contains(&logging.format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported log format '{}'; expected one of: {}",
                logging.format,
                FORMATS.join(", ")
            ),
        ));
    }
    if let Some(bad) = logging
        .directives
        .iter()
        .find(|d| d.trim().is_empty() || d.chars().any(char::is_whitespace))
    {
        return Err(invalid("logging.directives", format!("malformed directive '{bad}'")));
    }
    Ok(())
}

fn validate_repository(config: &Config) -> ConfigResult<()> {
    match config.repository.location.as_deref() {
        Some(location) if location.trim().is_empty() => Err(invalid(
            "repository.location",
            "location must not be empty when set".to_owned(),
        )),
        _ => Ok(()),
    }
}
