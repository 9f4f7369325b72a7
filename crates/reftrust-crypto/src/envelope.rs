//! Signed envelopes for metadata documents and attestations.
//!
//! Signatures cover a pre-authentication encoding of the payload type and
//! payload (`"DSSEv1" SP len(type) SP type SP len(payload) SP payload`), so a
//! signature over one document type can never be replayed as another.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::{KeyId, KeyPair, PublicKey};
use crate::signature::DetachedSignature;

/// A payload with zero or more detached signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Media type of the payload.
    pub payload_type: String,
    /// Raw payload bytes (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Signatures over the encoded payload.
    pub signatures: Vec<DetachedSignature>,
}

impl Envelope {
    /// Create an unsigned envelope.
    #[must_use]
    pub fn new(payload_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            payload_type: payload_type.into(),
            payload,
            signatures: Vec::new(),
        }
    }

    /// Create an unsigned envelope carrying `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::PayloadError`] if serialization fails.
    pub fn from_json<T: Serialize>(payload_type: impl Into<String>, value: &T) -> CryptoResult<Self> {
        let payload =
            serde_json::to_vec(value).map_err(|e| CryptoError::PayloadError(e.to_string()))?;
        Ok(Self::new(payload_type, payload))
    }

    /// Decode the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::PayloadError`] if the payload is not valid JSON for `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> CryptoResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| CryptoError::PayloadError(e.to_string()))
    }

    /// The bytes that signatures cover.
    #[must_use]
    pub fn signing_bytes(&self) -> Vec<u8> {
        let type_len = self.payload_type.len().to_string();
        let payload_len = self.payload.len().to_string();
        let mut buf = Vec::with_capacity(
            16usize
                .saturating_add(self.payload_type.len())
                .saturating_add(self.payload.len()),
        );
        buf.extend_from_slice(b"DSSEv1 ");
        buf.extend_from_slice(type_len.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.payload_type.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(payload_len.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Add (or replace) this key's signature.
    pub fn sign(&mut self, key: &KeyPair) {
        let signature = key.sign_detached(&self.signing_bytes());
        self.signatures.retain(|s| s.key_id != signature.key_id);
        self.signatures.push(signature);
    }

    /// Ids of the keys in `trusted` that produced a valid signature.
    ///
    /// Each key is counted once no matter how many signatures name it.
    #[must_use]
    pub fn valid_signers(&self, trusted: &[PublicKey]) -> BTreeSet<KeyId> {
        let message = self.signing_bytes();
        let mut signers = BTreeSet::new();
        for key in trusted {
            let key_id = key.key_id();
            if signers.contains(&key_id) {
                continue;
            }
            if self
                .signatures
                .iter()
                .any(|s| s.verify(key, &message).is_ok())
            {
                signers.insert(key_id);
            }
        }
        signers
    }

    /// Require at least `threshold` distinct trusted signers.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidThreshold`] if `threshold` is zero or
    /// larger than the trusted key set, and [`CryptoError::ThresholdNotMet`]
    /// if too few trusted keys signed.
    pub fn verify_threshold(
        &self,
        trusted: &[PublicKey],
        threshold: usize,
    ) -> CryptoResult<BTreeSet<KeyId>> {
        let distinct: BTreeSet<KeyId> = trusted.iter().map(PublicKey::key_id).collect();
        if threshold == 0 || threshold > distinct.len() {
            return Err(CryptoError::InvalidThreshold {
                threshold,
                keys: distinct.len(),
            });
        }
        let signers = self.valid_signers(trusted);
        if signers.len() < threshold {
            return Err(CryptoError::ThresholdNotMet {
                required: threshold,
                actual: signers.len(),
            });
        }
        Ok(signers)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
