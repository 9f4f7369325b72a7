//! Config file discovery and layered loading.
//!
//! `load` works in six steps:
//! 1. Parse the embedded `defaults.toml`
//! 2. Merge the user config (`$REFTRUST_HOME/config.toml`, or the
//!    platform config directory)
//! 3. Merge `{workspace}/.reftrust/config.toml`, which cannot enable a
//!    restricted mode the earlier layers left off
//! 4. Apply `REFTRUST_*` environment overrides
//! 5. Deserialize into [`Config`]
//! 6. Validate

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{
    ConfigLayer, FieldSources, deep_merge_tracking, enforce_workspace_restrictions, record_leaves,
};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Directory under a workspace root holding its config.
pub const WORKSPACE_DIR: &str = ".reftrust";

/// A loaded configuration and where its values came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Layer that set each leaf field.
    pub field_sources: FieldSources,
    /// Files merged, in order.
    pub loaded_files: Vec<String>,
}

/// Load the layered configuration.
///
/// `home_override` replaces user config discovery: `{home_override}/config.toml`
/// is used directly. `env` holds the `REFTRUST_*` variables to honor.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is unreadable or malformed, an
/// environment variable is unusable, or the result fails validation.
pub fn load(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value = toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
        path: "<embedded defaults>".to_owned(),
        source: e,
    })?;
    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", ConfigLayer::Defaults, &mut field_sources);

    if let Some(path) = user_config_path(home_override, env)
        && let Some(overlay) = try_load_file(&path)?
    {
        deep_merge_tracking(&mut merged, &overlay, "", ConfigLayer::User, &mut field_sources);
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), "Loaded user config");
    }

    if let Some(root) = workspace_root {
        let path = root.join(WORKSPACE_DIR).join("config.toml");
        if let Some(overlay) = try_load_file(&path)? {
            let baseline = merged.clone();
            deep_merge_tracking(&mut merged, &overlay, "", ConfigLayer::Workspace, &mut field_sources);
            enforce_workspace_restrictions(&mut merged, &baseline, &mut field_sources);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), "Loaded workspace config");
        }
    }

    let overrides = apply_env_overrides(&mut merged, &mut field_sources, env)?;
    if overrides > 0 {
        debug!(count = overrides, "Applied environment overrides");
    }

    let config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: "<merged config>".to_owned(),
            source: e,
        })?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a single file with no layering.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is missing, unreadable,
/// malformed or invalid.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let content = read_bounded(path)?;
    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    validate::validate(&config)?;
    Ok(config)
}

fn user_config_path(home_override: Option<&Path>, env: &BTreeMap<String, String>) -> Option<PathBuf> {
    if let Some(home) = home_override {
        return Some(home.join("config.toml"));
    }
    if let Some(home) = env.get("REFTRUST_HOME").filter(|h| !h.is_empty()) {
        return Some(PathBuf::from(home).join("config.toml"));
    }
    directories::ProjectDirs::from("", "", "reftrust").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn read_bounded(path: &Path) -> ConfigResult<String> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }
    Ok(content)
}

/// Parse `path`, or `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match read_bounded(path) {
        Ok(content) => content,
        Err(ConfigError::ReadError { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            debug!(path = %path.display(), "Config file not found, skipping");
            return Ok(None);
        },
        Err(e) => return Err(e),
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults_deserialize() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_layer_precedence() {
        let home = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        write(
            home.path(),
            "config.toml",
            "[logging]\nlevel = \"debug\"\nformat = \"json\"\n[mode]\ndeveloper = true\n",
        );
        write(
            &workspace.path().join(WORKSPACE_DIR),
            "config.toml",
            "[logging]\nformat = \"compact\"\n[repository]\nlocation = \"https://example.com/app\"\n",
        );
        let env: BTreeMap<String, String> = [("REFTRUST_LOG".to_owned(), "warn".to_owned())].into();

        let resolved = load(Some(workspace.path()), Some(home.path()), &env).unwrap();
        let config = &resolved.config;
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, "compact");
        assert!(config.mode.developer);
        assert_eq!(config.repository.location.as_deref(), Some("https://example.com/app"));
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(resolved.field_sources.get("logging.level"), Some(&ConfigLayer::Environment));
        assert_eq!(resolved.field_sources.get("logging.format"), Some(&ConfigLayer::Workspace));
        assert!(config.mode_context().developer);
    }

    #[test]
    fn test_workspace_cannot_enable_eval() {
        let home = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        write(&workspace.path().join(WORKSPACE_DIR), "config.toml", "[mode]\neval = true\n");

        let resolved = load(Some(workspace.path()), Some(home.path()), &BTreeMap::new()).unwrap();
        assert!(!resolved.config.mode.eval);

        let env: BTreeMap<String, String> = [("REFTRUST_EVAL".to_owned(), "true".to_owned())].into();
        let resolved = load(Some(workspace.path()), Some(home.path()), &env).unwrap();
        assert!(resolved.config.mode_context().eval);
    }

    #[test]
    fn test_malformed_file() {
        let home = tempfile::tempdir().unwrap();
        write(home.path(), "config.toml", "[logging\nlevel = ");
        let err = load(None, Some(home.path()), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_invalid_value_fails_validation() {
        let home = tempfile::tempdir().unwrap();
        write(home.path(), "config.toml", "[logging]\nlevel = \"chatty\"\n");
        let err = load(None, Some(home.path()), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_load_file_missing() {
        let err = load_file(Path::new("/nonexistent/reftrust.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = format!("x = \"{}\"", "a".repeat(MAX_CONFIG_FILE_SIZE));
        let path = write(dir.path(), "huge.toml", &data);
        assert!(matches!(
            try_load_file(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
