//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_crypto::prelude::*;` to import all essential types.

// Errors
pub use crate::{CryptoError, CryptoResult};

// Keys
pub use crate::{KeyId, KeyPair, PublicKey};

// Signatures
pub use crate::{DetachedSignature, Envelope, Signature};

// Hashing
pub use crate::ContentHash;
