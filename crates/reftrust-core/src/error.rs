//! Error classification shared across crates.
//!
//! Each crate keeps its own error enum. [`Classify`] maps those onto one
//! small taxonomy so callers can decide how to react (and which exit status
//! to use) without matching on every crate's variants.

use serde::{Deserialize, Serialize};

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing entry, attestation, key or reference.
    NotFound,
    /// Divergent or concurrently updated state.
    Conflict,
    /// Threshold unmet, untrusted signature, broken root continuity.
    Unauthorized,
    /// Malformed thresholds or missing required references.
    InvalidInput,
    /// Operation requires developer or eval mode.
    ModeRestricted,
    /// Operation aborted through its cancellation signal.
    Cancelled,
    /// Storage or encoding fault.
    Internal,
}

impl ErrorKind {
    /// Process exit status for this kind of failure.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Unauthorized => 2,
            Self::NotFound => 3,
            Self::Conflict => 4,
            Self::InvalidInput => 5,
            Self::ModeRestricted => 6,
            Self::Cancelled => 130,
            Self::Internal => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::InvalidInput => "invalid input",
            Self::ModeRestricted => "mode restricted",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors that can report their [`ErrorKind`].
pub trait Classify {
    /// The category of this error.
    fn kind(&self) -> ErrorKind;
}
