//! Environment variable overrides.
//!
//! | Variable | Field |
//! |---|---|
//! | `REFTRUST_DEV` | `mode.developer` |
//! | `REFTRUST_EVAL` | `mode.eval` |
//! | `REFTRUST_LOG` | `logging.level` |
//!
//! `REFTRUST_HOME` is read by the loader to locate the user config file.

use std::collections::BTreeMap;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

/// Prefix of every variable this crate reads.
pub const ENV_PREFIX: &str = "REFTRUST_";

/// Snapshot of the `REFTRUST_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

fn parse_flag(var_name: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::EnvError {
            var_name: var_name.to_owned(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn set(merged: &mut toml::Value, section: &str, key: &str, value: toml::Value) {
    if let toml::Value::Table(root) = merged {
        let table = root
            .entry(section.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        if let toml::Value::Table(table) = table {
            table.insert(key.to_owned(), value);
        }
    }
}

/// Apply overrides from `env`. Returns how many fields were set.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] for a mode flag that is not a boolean.
pub fn apply_env_overrides(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env: &BTreeMap<String, String>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;
    for (var, key) in [("REFTRUST_DEV", "developer"), ("REFTRUST_EVAL", "eval")] {
        if let Some(raw) = env.get(var) {
            set(merged, "mode", key, toml::Value::Boolean(parse_flag(var, raw)?));
            sources.insert(format!("mode.{key}"), ConfigLayer::Environment);
            count = count.saturating_add(1);
        }
    }
    if let Some(level) = env.get("REFTRUST_LOG").filter(|l| !l.trim().is_empty()) {
        set(
            merged,
            "logging",
            "level",
            toml::Value::String(level.trim().to_ascii_lowercase()),
        );
        sources.insert("logging.level".to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }
    Ok(count)
}
