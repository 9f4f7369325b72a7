//! Reftrust Config - layered configuration.
//!
//! # Usage
//!
//! ```rust,no_run
//! use reftrust_config::Config;
//!
//! let resolved = Config::load(Some(std::path::Path::new("."))).unwrap();
//! let mode = resolved.config.mode_context();
//! println!("developer mode: {}", mode.developer);
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. Environment (`REFTRUST_DEV`, `REFTRUST_EVAL`, `REFTRUST_LOG`)
//! 2. Workspace (`{workspace}/.reftrust/config.toml`), which may turn a
//!    restricted mode off but never on
//! 3. User (`$REFTRUST_HOME/config.toml`, else the platform config dir)
//! 4. Embedded defaults

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Config file discovery and loading.
pub mod loader;
/// Layered merging with provenance.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::ResolvedConfig;
pub use merge::ConfigLayer;
pub use types::*;

impl Config {
    /// Load with the full precedence chain and the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any layer is malformed or the result
    /// fails validation.
    pub fn load(workspace_root: Option<&std::path::Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(workspace_root, None, &env::collect_env_vars())
    }

    /// Load with the user config read from `home_dir/config.toml`.
    ///
    /// # Errors
    ///
    /// As [`Config::load`].
    pub fn load_with_home(
        workspace_root: Option<&std::path::Path>,
        home_dir: &std::path::Path,
    ) -> ConfigResult<ResolvedConfig> {
        loader::load(workspace_root, Some(home_dir), &env::collect_env_vars())
    }

    /// Load a single file with no layering.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed or
    /// validated.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
