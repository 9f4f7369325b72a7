//! Reftrust Storage - the persistence layer under the trust overlay.
//!
//! Three layers, each built on the one before:
//!
//! # Key-value ([`KvStore`])
//!
//! Namespaced byte-level `get`/`set`/`delete` plus an atomic
//! compare-and-swap. [`MemoryKvStore`] is always available; the **`kv`**
//! feature adds the persistent, ACID `SurrealKvStore`.
//!
//! # Objects ([`ObjectStore`])
//!
//! Content-addressed blobs, flat path trees and signed commits. Ids are
//! domain-separated BLAKE3 hashes, so an id names exactly one record.
//!
//! # References ([`RefStore`], [`Repository`])
//!
//! Named pointers to commits with compare-and-swap updates, and the
//! [`Repository`] handle that bundles objects and references with ancestry
//! queries.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod kv;
pub mod object;
pub mod refs;
pub mod repository;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKvStore, ScopedKvStore};
pub use object::{Commit, ObjectId, ObjectStore, Tree};
pub use refs::RefStore;
pub use repository::Repository;

#[cfg(feature = "kv")]
pub use kv::SurrealKvStore;
