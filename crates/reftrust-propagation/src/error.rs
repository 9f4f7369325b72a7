//! Propagation error types.

use reftrust_core::{Classify, ErrorKind};
use reftrust_policy::PolicyError;
use reftrust_rsl::RslError;
use reftrust_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while propagating content.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// The downstream path was changed locally since the last propagation.
    #[error(
        "directive '{directive}': {downstream_path} on {downstream_reference} was modified since it was last propagated"
    )]
    Conflict {
        /// Directive name.
        directive: String,
        /// Downstream reference.
        downstream_reference: String,
        /// Downstream path.
        downstream_path: String,
    },

    /// The latest upstream entry for the reference records no target.
    #[error("directive '{directive}': upstream {reference} has no recorded target")]
    UpstreamNotFound {
        /// Directive name.
        directive: String,
        /// Upstream reference.
        reference: String,
    },

    /// The caller cancelled the run.
    #[error("propagation cancelled")]
    Cancelled,

    /// Policy error.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Log error.
    #[error(transparent)]
    Rsl(#[from] RslError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for propagation.
pub type PropagationResult<T> = Result<T, PropagationError>;

impl Classify for PropagationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::UpstreamNotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Policy(e) => e.kind(),
            Self::Rsl(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}
