//! Attestation types.

use std::collections::BTreeSet;

use reftrust_crypto::Envelope;
use reftrust_storage::ObjectId;
use serde::{Deserialize, Serialize};

/// Payload type of approval envelopes.
pub const APPROVAL_PAYLOAD_TYPE: &str = "application/vnd.reftrust.pull-request-approval+json";

/// Payload type of hat envelopes.
pub const HAT_PAYLOAD_TYPE: &str = "application/vnd.reftrust.hat+json";

/// Payload type of reference authorization envelopes.
pub const REFERENCE_AUTHORIZATION_PAYLOAD_TYPE: &str =
    "application/vnd.reftrust.reference-authorization+json";

/// Approvals witnessed for one change of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestApproval {
    /// Reference the change applies to.
    pub ref_name: String,
    /// Target the reference pointed at before the change.
    pub prior_target_id: ObjectId,
    /// Target after the change.
    pub target_id: ObjectId,
    /// Identities currently approving.
    #[serde(default)]
    pub approvers: BTreeSet<String>,
    /// Identities whose approval was withdrawn.
    #[serde(default)]
    pub dismissed_approvers: BTreeSet<String>,
}

impl PullRequestApproval {
    /// A new approval with no approvers yet.
    #[must_use]
    pub fn new(ref_name: impl Into<String>, prior_target_id: ObjectId, target_id: ObjectId) -> Self {
        Self {
            ref_name: ref_name.into(),
            prior_target_id,
            target_id,
            approvers: BTreeSet::new(),
            dismissed_approvers: BTreeSet::new(),
        }
    }

    /// Add `approver`, clearing any earlier dismissal.
    pub fn approve(&mut self, approver: &str) {
        self.dismissed_approvers.remove(approver);
        self.approvers.insert(approver.to_string());
    }

    /// Move `approver` to the dismissed set. Returns `false` if they were
    /// not approving.
    pub fn dismiss(&mut self, approver: &str) -> bool {
        if self.approvers.remove(approver) {
            self.dismissed_approvers.insert(approver.to_string());
            true
        } else {
            false
        }
    }
}

/// Declaration that a change was made on behalf of a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hat {
    /// Reference the change applies to.
    pub ref_name: String,
    /// Target after the change.
    pub target_id: ObjectId,
    /// Team principal the change is made for.
    pub team_id: String,
}

/// Detached approval of one change of a reference, signed by each approver
/// with their own key.
///
/// A zero `from_target_id` stands for a reference that has no recorded
/// target yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceAuthorization {
    /// Reference the change applies to.
    pub ref_name: String,
    /// Target the reference points at before the change.
    pub from_target_id: ObjectId,
    /// Target after the change.
    pub target_id: ObjectId,
}

impl ReferenceAuthorization {
    /// Authorization for `ref_name` moving from `from` (`None` for a new
    /// reference) to `target_id`.
    #[must_use]
    pub fn new(ref_name: impl Into<String>, from: Option<ObjectId>, target_id: ObjectId) -> Self {
        Self {
            ref_name: ref_name.into(),
            from_target_id: from.unwrap_or_else(ObjectId::zero),
            target_id,
        }
    }

    /// Whether this authorizes `ref_name` moving from `from` to `target_id`.
    #[must_use]
    pub fn covers(&self, ref_name: &str, from: Option<ObjectId>, target_id: ObjectId) -> bool {
        self.ref_name == ref_name
            && self.target_id == target_id
            && self.from_target_id == from.unwrap_or_else(ObjectId::zero)
    }
}

/// Any attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attestation {
    /// Witnessed review approvals.
    PullRequestApproval(PullRequestApproval),
    /// Team hat.
    Hat(Hat),
    /// Detached approval signed by the approvers.
    ReferenceAuthorization(ReferenceAuthorization),
}

impl Attestation {
    /// Reference the attestation applies to.
    #[must_use]
    pub fn ref_name(&self) -> &str {
        match self {
            Self::PullRequestApproval(a) => &a.ref_name,
            Self::Hat(h) => &h.ref_name,
            Self::ReferenceAuthorization(r) => &r.ref_name,
        }
    }

    /// Target state the attestation applies to.
    #[must_use]
    pub fn target_id(&self) -> ObjectId {
        match self {
            Self::PullRequestApproval(a) => a.target_id,
            Self::Hat(h) => h.target_id,
            Self::ReferenceAuthorization(r) => r.target_id,
        }
    }
}

/// An attestation with the signed envelope it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attested<T> {
    /// Decoded attestation.
    pub value: T,
    /// Envelope carrying the witness signatures.
    pub envelope: Envelope,
}
