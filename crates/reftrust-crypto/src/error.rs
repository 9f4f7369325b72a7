//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// Invalid signature length.
    #[error("invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// Invalid public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Fewer distinct trusted keys signed than required.
    #[error("signature threshold not met: required {required}, got {actual}")]
    ThresholdNotMet {
        /// Signatures required.
        required: usize,
        /// Valid distinct signatures found.
        actual: usize,
    },

    /// A threshold of zero or above the key count was requested.
    #[error("invalid threshold {threshold} for {keys} keys")]
    InvalidThreshold {
        /// Requested threshold.
        threshold: usize,
        /// Number of keys available.
        keys: usize,
    },

    /// Invalid hex encoding.
    #[error("invalid hex encoding")]
    InvalidHexEncoding,

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding")]
    InvalidBase64Encoding,

    /// Envelope payload could not be encoded or decoded.
    #[error("payload encoding error: {0}")]
    PayloadError(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
