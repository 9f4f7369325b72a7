//! Developer and eval mode gating.
//!
//! Experimental or unsafe operations (recording approvals by hand, writing
//! log entries for arbitrary past commits, verifying from an arbitrary
//! entry) only run when the caller's [`ModeContext`] enables the matching
//! mode. The context is an explicit value handed to stores and verifiers at
//! construction; nothing reads process state behind the caller's back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A restricted operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Developer mode: experimental features.
    Developer,
    /// Eval mode: operations used to evaluate the overlay on existing history.
    Eval,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Developer => f.write_str("developer"),
            Self::Eval => f.write_str("eval"),
        }
    }
}

/// Returned when a gated operation runs outside its mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{operation}' is only available in {mode} mode")]
pub struct ModeRestricted {
    /// Name of the rejected operation.
    pub operation: String,
    /// Mode it requires.
    pub mode: Mode,
}

/// Which restricted modes are enabled for a call chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeContext {
    /// Developer mode enabled.
    #[serde(default)]
    pub developer: bool,
    /// Eval mode enabled.
    #[serde(default)]
    pub eval: bool,
}

impl ModeContext {
    /// Neither mode enabled.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            developer: false,
            eval: false,
        }
    }

    /// Developer mode only.
    #[must_use]
    pub const fn developer() -> Self {
        Self {
            developer: true,
            eval: false,
        }
    }

    /// Eval mode only.
    #[must_use]
    pub const fn eval() -> Self {
        Self {
            developer: false,
            eval: true,
        }
    }

    /// Whether `mode` is enabled.
    #[must_use]
    pub const fn allows(&self, mode: Mode) -> bool {
        match mode {
            Mode::Developer => self.developer,
            Mode::Eval => self.eval,
        }
    }

    /// Fail unless `mode` is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ModeRestricted`] naming `operation` when the mode is off.
    pub fn require(&self, mode: Mode, operation: &str) -> Result<(), ModeRestricted> {
        if self.allows(mode) {
            Ok(())
        } else {
            Err(ModeRestricted {
                operation: operation.to_string(),
                mode,
            })
        }
    }
}
