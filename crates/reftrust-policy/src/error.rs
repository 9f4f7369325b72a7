//! Policy error types.

use reftrust_attestations::AttestationError;
use reftrust_core::{Classify, ErrorKind, ModeRestricted};
use reftrust_crypto::CryptoError;
use reftrust_rsl::RslError;
use reftrust_storage::StorageError;
use thiserror::Error;

/// Errors that can occur with policy resolution and application.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No policy has been applied yet.
    #[error("no policy found{0}")]
    NotFound(String),

    /// Signatures do not meet the required threshold.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A root version is not signed by enough keys of its predecessor.
    #[error("root chain broken at version {version}: {reason}")]
    RootChainBroken {
        /// Version that failed to verify.
        version: u64,
        /// Why it failed.
        reason: String,
    },

    /// Metadata is malformed or internally inconsistent.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A controller repository could not be trusted.
    #[error("controller '{name}': {reason}")]
    Controller {
        /// Controller name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A repository location could not be resolved.
    #[error("repository '{0}' is not reachable")]
    RepositoryNotFound(String),

    /// Operation gated behind a mode that is off.
    #[error(transparent)]
    Mode(#[from] ModeRestricted),

    /// Envelope or key error.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

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

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

impl Classify for PolicyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::RepositoryNotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) | Self::RootChainBroken { .. } | Self::Controller { .. } => {
                ErrorKind::Unauthorized
            },
            Self::InvalidMetadata(_) => ErrorKind::InvalidInput,
            Self::Mode(_) => ErrorKind::ModeRestricted,
            Self::Crypto(CryptoError::InvalidThreshold { .. }) => ErrorKind::InvalidInput,
            Self::Crypto(CryptoError::ThresholdNotMet { .. }) => ErrorKind::Unauthorized,
            Self::Crypto(_) => ErrorKind::Internal,
            Self::Attestation(e) => e.kind(),
            Self::Rsl(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}
