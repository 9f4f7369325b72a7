//! Attestation error types.

use reftrust_core::{Classify, ErrorKind, ModeRestricted};
use reftrust_crypto::CryptoError;
use reftrust_rsl::RslError;
use reftrust_storage::StorageError;
use thiserror::Error;

/// Errors that can occur with attestations.
#[derive(Debug, Error)]
pub enum AttestationError {
    /// No attestation recorded for this reference state.
    #[error("no {kind} attestation for {ref_name} at {target}")]
    NotFound {
        /// Attestation kind.
        kind: &'static str,
        /// Reference name.
        ref_name: String,
        /// Target id (hex).
        target: String,
    },

    /// The request contradicts the recorded attestation.
    #[error("invalid attestation: {0}")]
    Invalid(String),

    /// The approver never approved this reference state.
    #[error("approver '{approver}' has not approved this change")]
    ApproverNotFound {
        /// The approver.
        approver: String,
    },

    /// Operation gated behind a mode that is off.
    #[error(transparent)]
    Mode(#[from] ModeRestricted),

    /// Envelope encoding or signature error.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Log error.
    #[error(transparent)]
    Rsl(#[from] RslError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for attestation operations.
pub type AttestationResult<T> = Result<T, AttestationError>;

impl Classify for AttestationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::ApproverNotFound { .. } => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::InvalidInput,
            Self::Mode(_) => ErrorKind::ModeRestricted,
            Self::Crypto(_) => ErrorKind::Internal,
            Self::Rsl(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}
