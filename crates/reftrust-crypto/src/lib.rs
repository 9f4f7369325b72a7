//! Reftrust Crypto - signing primitives for the trust overlay.
//!
//! This crate provides:
//! - Ed25519 key pairs and public keys identified by a stable [`KeyId`]
//! - Detached signatures attached to log entries, commits and metadata
//! - BLAKE3 content hashes used as object and entry identifiers
//! - Signed [`Envelope`]s with threshold verification for policy documents
//!   and attestations
//!
//! # Example
//!
//! ```
//! use reftrust_crypto::{Envelope, KeyPair};
//!
//! let k1 = KeyPair::generate();
//! let k2 = KeyPair::generate();
//!
//! let mut envelope = Envelope::new("application/json", b"{}".to_vec());
//! envelope.sign(&k1);
//! envelope.sign(&k2);
//!
//! let trusted = [k1.public_key(), k2.public_key()];
//! let signers = envelope.verify_threshold(&trusted, 2).unwrap();
//! assert_eq!(signers.len(), 2);
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod envelope;
mod error;
mod hash;
mod keypair;
mod signature;

pub use envelope::Envelope;
pub use error::{CryptoError, CryptoResult};
pub use hash::ContentHash;
pub use keypair::{KeyId, KeyPair, PublicKey};
pub use signature::{DetachedSignature, Signature};
