//! Reftrust RSL - the reference state log.
//!
//! This crate provides:
//! - One global, hash-chained, append-only log of reference updates
//! - Annotations that comment on (or skip) earlier entries
//! - Propagation entries recording content copied from an upstream repository
//! - Duplicate suppression for repeated updates to the same target
//! - Pull/push against a remote log with divergence detection
//!
//! # Model
//!
//! Every node has a 1-based number and the id of the node before it,
//! whichever reference it concerns. Ids are content hashes over number,
//! parent and body, so editing history is detectable by
//! [`ReferenceStateLog::verify_chain`].
//!
//! # Example
//!
//! ```
//! use reftrust_core::ModeContext;
//! use reftrust_crypto::ContentHash;
//! use reftrust_rsl::{CreateEntryOptions, LatestEntryOptions, ReferenceStateLog};
//! use reftrust_storage::Repository;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let log = ReferenceStateLog::open(Repository::in_memory().unwrap(), ModeContext::strict()).unwrap();
//! let target = ContentHash::hash(b"commit");
//!
//! let first = log.create_entry("main", target, CreateEntryOptions::default()).await.unwrap();
//! let again = log.create_entry("main", target, CreateEntryOptions::default()).await.unwrap();
//! assert_eq!(first.id, again.id);
//!
//! let latest = log
//!     .get_latest_entry("refs/heads/main", &LatestEntryOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(latest.id, first.id);
//! # });
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod entry;
mod error;
mod log;
mod remote;

pub use entry::{EntryBody, EntryId, RslEntry};
pub use error::{RslError, RslResult};
pub use log::{
    ChainIssue, ChainVerificationResult, CreateEntryOptions, LatestEntryOptions,
    ReferenceStateLog,
};
pub use remote::{PullOutcome, PushOutcome, RemoteLog, RemoteStatus};
