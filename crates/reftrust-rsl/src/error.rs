//! Log-related error types.

use reftrust_core::{Classify, ErrorKind, ModeRestricted};
use reftrust_storage::StorageError;
use thiserror::Error;

use crate::entry::EntryId;

/// Errors that can occur with the reference state log.
#[derive(Debug, Error)]
pub enum RslError {
    /// No entry matched the query.
    #[error("no log entry found for {0}")]
    NotFound(String),

    /// An entry id is not part of the chain.
    #[error("log entry not found: {0}")]
    EntryNotFound(EntryId),

    /// An annotation names an entry that is not part of the chain.
    #[error("annotation references unknown entry {0}")]
    InvalidReference(EntryId),

    /// Caller supplied malformed arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Local and remote chains both grew since their last common entry.
    #[error("log has diverged from remote '{remote}'")]
    Diverged {
        /// Remote name.
        remote: String,
    },

    /// The remote head moved between reading it and updating it.
    #[error("remote '{remote}' was updated concurrently; pull and retry")]
    UpdateConflict {
        /// Remote name.
        remote: String,
    },

    /// The local head moved while an entry was being appended.
    #[error("local log head moved during append")]
    ConcurrentAppend,

    /// A commit is not reachable from the reference it was recorded for.
    #[error("commit {commit} is not in {ref_name}")]
    CommitNotInRef {
        /// Commit id (hex).
        commit: String,
        /// Reference name.
        ref_name: String,
    },

    /// A stored or received entry is inconsistent with the chain.
    #[error("chain integrity violation at entry {entry_id}: {reason}")]
    IntegrityViolation {
        /// The entry where violation was detected.
        entry_id: EntryId,
        /// Why the chain is invalid.
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport failure talking to a remote.
    #[error("remote error: {0}")]
    Remote(String),

    /// Operation gated behind a mode that is off.
    #[error(transparent)]
    Mode(#[from] ModeRestricted),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for log operations.
pub type RslResult<T> = Result<T, RslError>;

impl Classify for RslError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::EntryNotFound(_) => ErrorKind::NotFound,
            Self::InvalidReference(_) | Self::InvalidInput(_) | Self::CommitNotInRef { .. } => {
                ErrorKind::InvalidInput
            },
            Self::Diverged { .. } | Self::UpdateConflict { .. } | Self::ConcurrentAppend => {
                ErrorKind::Conflict
            },
            Self::IntegrityViolation { .. } => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Remote(_) => ErrorKind::Internal,
            Self::Mode(_) => ErrorKind::ModeRestricted,
            Self::Storage(e) => e.kind(),
        }
    }
}
