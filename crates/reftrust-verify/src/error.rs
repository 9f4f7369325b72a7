//! Verification error types.

use reftrust_attestations::AttestationError;
use reftrust_core::{Classify, ErrorKind, ModeRestricted};
use reftrust_policy::PolicyError;
use reftrust_rsl::RslError;
use reftrust_storage::StorageError;
use thiserror::Error;

/// Errors that can occur during verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A verdict was required to be positive and was not.
    #[error("{ref_name} is not authorized: {}", reasons.join("; "))]
    Unauthorized {
        /// Reference verified.
        ref_name: String,
        /// Why.
        reasons: Vec<String>,
    },

    /// The log has no unskipped entry for the reference.
    #[error("no log entry records {0}")]
    NoEntry(String),

    /// The reference does not exist in the repository.
    #[error("reference {0} does not exist")]
    NoTip(String),

    /// The reference tip was moved without a log entry.
    #[error("tip {tip} of {ref_name} is not recorded in the log")]
    TipNotRecorded {
        /// Reference.
        ref_name: String,
        /// Current tip (hex).
        tip: String,
    },

    /// No log entry for the reference records or contains the commit.
    #[error("commit {commit} is not recorded for {ref_name}")]
    CommitNotRecorded {
        /// Reference.
        ref_name: String,
        /// Commit (hex).
        commit: String,
    },

    /// The entry does not record the reference it was verified against.
    #[error("entry {entry} does not record {ref_name}")]
    EntryMismatch {
        /// Entry id (hex).
        entry: String,
        /// Reference.
        ref_name: String,
    },

    /// Operation gated behind a mode that is off.
    #[error(transparent)]
    Mode(#[from] ModeRestricted),

    /// Policy error.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Attestation error.
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    /// Log error.
    #[error(transparent)]
    Rsl(#[from] RslError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for verification.
pub type VerifyResult<T> = Result<T, VerifyError>;

impl Classify for VerifyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized { .. } | Self::TipNotRecorded { .. } => ErrorKind::Unauthorized,
            Self::NoEntry(_) | Self::NoTip(_) | Self::CommitNotRecorded { .. } => {
                ErrorKind::NotFound
            },
            Self::EntryMismatch { .. } => ErrorKind::InvalidInput,
            Self::Mode(_) => ErrorKind::ModeRestricted,
            Self::Policy(e) => e.kind(),
            Self::Attestation(e) => e.kind(),
            Self::Rsl(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}
