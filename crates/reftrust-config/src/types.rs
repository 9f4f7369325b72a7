//! Configuration struct definitions.
//!
//! Every section implements [`Default`] with the same values as the
//! embedded `defaults.toml`, so a bare `[section]` header yields a working
//! configuration.

use reftrust_core::ModeContext;
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Restricted operating modes.
    pub mode: ModeSection,
    /// Logging level, format and per-crate directives.
    pub logging: LoggingSection,
    /// Identity of the local repository.
    pub repository: RepositorySection,
    /// Propagation pass settings.
    pub propagation: PropagationSection,
    /// Verification settings.
    pub verify: VerifySection,
}

impl Config {
    /// The mode context handed to stores and verifiers.
    #[must_use]
    pub fn mode_context(&self) -> ModeContext {
        ModeContext {
            developer: self.mode.developer,
            eval: self.mode.eval,
        }
    }
}

/// Developer and eval mode switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSection {
    /// Enable developer-mode operations.
    pub developer: bool,
    /// Enable eval-mode operations.
    pub eval: bool,
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level (`"trace"`, `"debug"`, `"info"`, `"warn"`, `"error"`).
    pub level: String,
    /// `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate directives such as `"reftrust_rsl=debug"`.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}

/// Identity of the local repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    /// Location controllers list this repository under in their network.
    pub location: Option<String>,
}

/// Propagation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationSection {
    /// Run propagation directives after log updates.
    pub enabled: bool,
}

impl Default for PropagationSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Verification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySection {
    /// Pull the log from the remote before verifying.
    pub sync_remote: bool,
}
