//! Reftrust Verify - decides whether reference states are authorized.
//!
//! The [`Verifier`] ties the log, the policy in force at each entry and the
//! recorded attestations together. Every operation returns [`Verdict`]s
//! carrying the policy [`Decision`](reftrust_policy::Decision); a negative
//! verdict is a value, not an error, until
//! [`Verdict::ensure_authorized`] is called.
//!
//! - [`Verifier::verify_ref`] checks the latest entry of a reference and
//!   that its tip is recorded.
//! - [`Verifier::verify_ref_history`] checks every unskipped entry.
//! - [`Verifier::verify_commit`] checks the entry that brought in a commit.
//! - [`Verifier::verify_mergeable`] predicts a merge without writing.
//! - [`Verifier::verify_ref_from_entry`] checks from a chosen entry onward
//!   (developer mode).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod verifier;

pub use error::{VerifyError, VerifyResult};
pub use verifier::{Verdict, Verifier, VerifyOptions};
