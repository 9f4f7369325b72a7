//! Reftrust Attestations - externally witnessed approvals and hats.
//!
//! Three attestation kinds:
//!
//! - [`PullRequestApproval`]: identities that approved a change, as vouched
//!   for by a witness key. Dismissal moves an approver to a separate set
//!   rather than erasing the record. Keyed by `(reference, target)`.
//! - [`Hat`]: a declaration that a change was made on behalf of a team.
//!   Keyed by `(reference, target)`.
//! - [`ReferenceAuthorization`]: a change approved ahead of time, carrying
//!   one signature per approver. Keyed by `(reference, from, target)`.
//!
//! Attestations are written by the witness, never by the verifier. Writes go
//! through the log so every change to the attestation set is itself a
//! recorded, ordered event.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod attestation;
mod error;
mod store;

pub use attestation::{
    APPROVAL_PAYLOAD_TYPE, Attestation, Attested, HAT_PAYLOAD_TYPE, Hat, PullRequestApproval,
    REFERENCE_AUTHORIZATION_PAYLOAD_TYPE, ReferenceAuthorization,
};
pub use error::{AttestationError, AttestationResult};
pub use store::AttestationStore;
