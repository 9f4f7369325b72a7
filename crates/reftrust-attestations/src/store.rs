//! Attestation persistence on the attestations reference.
//!
//! Each attestation is a signed envelope stored as one file in the tree at
//! the tip of [`ATTESTATIONS_REF`]:
//!
//! - `pull-request-approvals/<ref>/<target>.json`
//! - `hats/<ref>/<target>.json`
//! - `reference-authorizations/<ref>/<from>-<target>.json`
//!
//! Every mutation writes one commit on that reference plus one log entry
//! recording it.

use std::sync::Arc;

use reftrust_core::{ATTESTATIONS_REF, Mode, ModeContext, absolute_reference};
use reftrust_crypto::{Envelope, KeyPair};
use reftrust_rsl::ReferenceStateLog;
use reftrust_storage::{ObjectId, Repository, Tree};
use tracing::{debug, info};

use crate::attestation::{
    APPROVAL_PAYLOAD_TYPE, Attestation, Attested, HAT_PAYLOAD_TYPE, Hat, PullRequestApproval,
    REFERENCE_AUTHORIZATION_PAYLOAD_TYPE, ReferenceAuthorization,
};
use crate::error::{AttestationError, AttestationResult};

const APPROVALS_DIR: &str = "pull-request-approvals";
const HATS_DIR: &str = "hats";
const AUTHORIZATIONS_DIR: &str = "reference-authorizations";

fn approval_path(ref_name: &str, target_id: &ObjectId) -> String {
    format!("{APPROVALS_DIR}/{ref_name}/{}.json", target_id.to_hex())
}

fn hat_path(ref_name: &str, target_id: &ObjectId) -> String {
    format!("{HATS_DIR}/{ref_name}/{}.json", target_id.to_hex())
}

fn authorization_path(authorization: &ReferenceAuthorization) -> String {
    format!(
        "{AUTHORIZATIONS_DIR}/{}/{}-{}.json",
        authorization.ref_name,
        authorization.from_target_id.to_hex(),
        authorization.target_id.to_hex()
    )
}

/// Reads and writes attestations for one repository.
#[derive(Debug, Clone)]
pub struct AttestationStore {
    repo: Repository,
    rsl: Arc<ReferenceStateLog>,
    mode: ModeContext,
}

impl AttestationStore {
    /// Create a store over the repository behind `rsl`.
    #[must_use]
    pub fn new(rsl: Arc<ReferenceStateLog>, mode: ModeContext) -> Self {
        Self {
            repo: rsl.repository().clone(),
            rsl,
            mode,
        }
    }

    async fn current_tree(&self) -> AttestationResult<Tree> {
        Ok(self.repo.tree_at_ref(ATTESTATIONS_REF).await?)
    }

    async fn read_envelope(&self, tree: &Tree, path: &str) -> AttestationResult<Option<Envelope>> {
        let Some(blob) = tree.entries.get(path) else {
            return Ok(None);
        };
        let bytes = self.repo.objects().get_blob(blob).await?;
        let envelope = serde_json::from_slice(&bytes)
            .map_err(|e| AttestationError::Invalid(format!("{path}: {e}")))?;
        Ok(Some(envelope))
    }

    async fn write_envelope(
        &self,
        mut tree: Tree,
        path: &str,
        envelope: &Envelope,
        message: &str,
    ) -> AttestationResult<()> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| AttestationError::Invalid(e.to_string()))?;
        let blob = self.repo.objects().put_blob(bytes).await?;
        tree.insert(path, blob);
        self.commit(&tree, path, message).await
    }

    async fn commit(&self, tree: &Tree, path: &str, message: &str) -> AttestationResult<()> {
        let (commit, entry) = self
            .rsl
            .commit_and_record(ATTESTATIONS_REF, tree, message, None)
            .await?;
        debug!(
            path,
            commit = %commit.short(),
            entry_id = %entry.id.short(),
            "Wrote attestation"
        );
        Ok(())
    }

    fn seal<T: serde::Serialize>(
        payload_type: &str,
        value: &T,
        signer: &KeyPair,
    ) -> AttestationResult<Envelope> {
        let mut envelope = Envelope::from_json(payload_type, value)?;
        envelope.sign(signer);
        Ok(envelope)
    }

    /// Record `approvers` for the change of `ref_name` from
    /// `prior_target_id` to `target_id`, merging with any existing record.
    ///
    /// `signer` is the witness (typically the app key) vouching for the
    /// approvals. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::Invalid`] if an existing record for the
    /// same target names a different prior target.
    pub async fn record_pull_request_approval(
        &self,
        ref_name: &str,
        prior_target_id: ObjectId,
        target_id: ObjectId,
        approvers: &[&str],
        signer: &KeyPair,
    ) -> AttestationResult<Attested<PullRequestApproval>> {
        self.mode
            .require(Mode::Developer, "record-pull-request-approval")?;
        let ref_name = absolute_reference(ref_name);
        let path = approval_path(&ref_name, &target_id);
        let tree = self.current_tree().await?;

        let mut approval = match self.read_envelope(&tree, &path).await? {
            Some(envelope) => {
                let existing: PullRequestApproval = envelope.decode()?;
                if existing.prior_target_id != prior_target_id {
                    return Err(AttestationError::Invalid(format!(
                        "approval for {ref_name} at {} is based on {}, not {}",
                        target_id.short(),
                        existing.prior_target_id.short(),
                        prior_target_id.short()
                    )));
                }
                existing
            },
            None => PullRequestApproval::new(ref_name.clone(), prior_target_id, target_id),
        };
        let before = approval.clone();
        for approver in approvers {
            approval.approve(approver);
        }
        let envelope = Self::seal(APPROVAL_PAYLOAD_TYPE, &approval, signer)?;
        if approval != before || tree.entries.get(&path).is_none() {
            self.write_envelope(tree, &path, &envelope, "Record pull request approval")
                .await?;
            info!(
                ref_name = %ref_name,
                target = %target_id.short(),
                approvers = approval.approvers.len(),
                "Recorded pull request approval"
            );
        }
        Ok(Attested {
            value: approval,
            envelope,
        })
    }

    /// Withdraw `approver`'s approval. Repeating it is a no-op.
    ///
    /// Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::NotFound`] if nothing was recorded for
    /// the target and [`AttestationError::ApproverNotFound`] if `approver`
    /// never approved it.
    pub async fn dismiss_approval(
        &self,
        ref_name: &str,
        target_id: ObjectId,
        approver: &str,
        signer: &KeyPair,
    ) -> AttestationResult<Attested<PullRequestApproval>> {
        self.mode.require(Mode::Developer, "dismiss-approval")?;
        let ref_name = absolute_reference(ref_name);
        let path = approval_path(&ref_name, &target_id);
        let tree = self.current_tree().await?;
        let envelope = self.read_envelope(&tree, &path).await?.ok_or_else(|| {
            AttestationError::NotFound {
                kind: "approval",
                ref_name: ref_name.clone(),
                target: target_id.to_hex(),
            }
        })?;
        let mut approval: PullRequestApproval = envelope.decode()?;

        if approval.dismissed_approvers.contains(approver) {
            return Ok(Attested {
                value: approval,
                envelope,
            });
        }
        if !approval.dismiss(approver) {
            return Err(AttestationError::ApproverNotFound {
                approver: approver.to_string(),
            });
        }
        let envelope = Self::seal(APPROVAL_PAYLOAD_TYPE, &approval, signer)?;
        self.write_envelope(tree, &path, &envelope, "Dismiss pull request approval")
            .await?;
        info!(ref_name = %ref_name, target = %target_id.short(), approver, "Dismissed approval");
        Ok(Attested {
            value: approval,
            envelope,
        })
    }

    /// Approval recorded for `ref_name` at `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::NotFound`] if none is recorded.
    pub async fn lookup(
        &self,
        ref_name: &str,
        target_id: ObjectId,
    ) -> AttestationResult<Attested<PullRequestApproval>> {
        let ref_name = absolute_reference(ref_name);
        let tree = self.current_tree().await?;
        let envelope = self
            .read_envelope(&tree, &approval_path(&ref_name, &target_id))
            .await?
            .ok_or_else(|| AttestationError::NotFound {
                kind: "approval",
                ref_name,
                target: target_id.to_hex(),
            })?;
        Ok(Attested {
            value: envelope.decode()?,
            envelope,
        })
    }

    /// Declare that the change of `ref_name` to `target_id` is made for
    /// `team_id`, replacing any earlier declaration. `signer` is the team
    /// member making the declaration. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the attestation cannot be written.
    pub async fn record_hat(
        &self,
        ref_name: &str,
        target_id: ObjectId,
        team_id: &str,
        signer: &KeyPair,
    ) -> AttestationResult<Attested<Hat>> {
        self.mode.require(Mode::Developer, "record-hat")?;
        let ref_name = absolute_reference(ref_name);
        let hat = Hat {
            ref_name: ref_name.clone(),
            target_id,
            team_id: team_id.to_string(),
        };
        let envelope = Self::seal(HAT_PAYLOAD_TYPE, &hat, signer)?;
        let tree = self.current_tree().await?;
        self.write_envelope(tree, &hat_path(&ref_name, &target_id), &envelope, "Record hat")
            .await?;
        info!(ref_name = %ref_name, target = %target_id.short(), team_id, "Recorded hat");
        Ok(Attested {
            value: hat,
            envelope,
        })
    }

    /// Hat recorded for `ref_name` at `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::NotFound`] if none is recorded.
    pub async fn lookup_hat(
        &self,
        ref_name: &str,
        target_id: ObjectId,
    ) -> AttestationResult<Attested<Hat>> {
        let ref_name = absolute_reference(ref_name);
        let tree = self.current_tree().await?;
        let envelope = self
            .read_envelope(&tree, &hat_path(&ref_name, &target_id))
            .await?
            .ok_or_else(|| AttestationError::NotFound {
                kind: "hat",
                ref_name,
                target: target_id.to_hex(),
            })?;
        Ok(Attested {
            value: envelope.decode()?,
            envelope,
        })
    }

    /// Add `signer`'s approval of `ref_name` moving from `from` (`None` for
    /// a new reference) to `target_id`. Each approver signs with their own
    /// key and signatures accumulate on one envelope. Signing again is a
    /// no-op. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::Invalid`] if the stored envelope does not
    /// describe the same change.
    pub async fn record_reference_authorization(
        &self,
        ref_name: &str,
        from: Option<ObjectId>,
        target_id: ObjectId,
        signer: &KeyPair,
    ) -> AttestationResult<Attested<ReferenceAuthorization>> {
        self.mode
            .require(Mode::Developer, "record-reference-authorization")?;
        let authorization = ReferenceAuthorization::new(absolute_reference(ref_name), from, target_id);
        let path = authorization_path(&authorization);
        let tree = self.current_tree().await?;

        let mut envelope = match self.read_envelope(&tree, &path).await? {
            Some(envelope) => {
                let stored: ReferenceAuthorization = envelope.decode()?;
                if stored != authorization {
                    return Err(AttestationError::Invalid(format!(
                        "{path} does not describe {} moving to {}",
                        authorization.ref_name,
                        target_id.short()
                    )));
                }
                if envelope
                    .valid_signers(&[signer.public_key()])
                    .contains(&signer.key_id())
                {
                    return Ok(Attested {
                        value: authorization,
                        envelope,
                    });
                }
                envelope
            },
            None => Envelope::from_json(REFERENCE_AUTHORIZATION_PAYLOAD_TYPE, &authorization)?,
        };
        envelope.sign(signer);
        self.write_envelope(tree, &path, &envelope, "Record reference authorization")
            .await?;
        info!(
            ref_name = %authorization.ref_name,
            target = %target_id.short(),
            signatures = envelope.signatures.len(),
            "Recorded reference authorization"
        );
        Ok(Attested {
            value: authorization,
            envelope,
        })
    }

    /// Reference authorization recorded for `ref_name` moving from `from`
    /// to `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::NotFound`] if none is recorded.
    pub async fn lookup_reference_authorization(
        &self,
        ref_name: &str,
        from: Option<ObjectId>,
        target_id: ObjectId,
    ) -> AttestationResult<Attested<ReferenceAuthorization>> {
        let wanted = ReferenceAuthorization::new(absolute_reference(ref_name), from, target_id);
        let tree = self.current_tree().await?;
        let envelope = self
            .read_envelope(&tree, &authorization_path(&wanted))
            .await?
            .ok_or_else(|| AttestationError::NotFound {
                kind: "reference authorization",
                ref_name: wanted.ref_name.clone(),
                target: target_id.to_hex(),
            })?;
        Ok(Attested {
            value: envelope.decode()?,
            envelope,
        })
    }

    /// Drop the reference authorization for `ref_name` moving from `from`
    /// to `target_id`, signatures and all. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`AttestationError::NotFound`] if none is recorded.
    pub async fn remove_reference_authorization(
        &self,
        ref_name: &str,
        from: Option<ObjectId>,
        target_id: ObjectId,
    ) -> AttestationResult<()> {
        self.mode
            .require(Mode::Developer, "remove-reference-authorization")?;
        let wanted = ReferenceAuthorization::new(absolute_reference(ref_name), from, target_id);
        let path = authorization_path(&wanted);
        let mut tree = self.current_tree().await?;
        if tree.entries.remove(&path).is_none() {
            return Err(AttestationError::NotFound {
                kind: "reference authorization",
                ref_name: wanted.ref_name,
                target: target_id.to_hex(),
            });
        }
        self.commit(&tree, &path, "Remove reference authorization")
            .await?;
        info!(ref_name = %wanted.ref_name, target = %target_id.short(), "Removed reference authorization");
        Ok(())
    }

    /// Every recorded attestation: approvals, then hats, then reference
    /// authorizations, each group in path order.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored envelope cannot be read or decoded.
    pub async fn list(&self) -> AttestationResult<Vec<Attestation>> {
        let tree = self.current_tree().await?;
        let mut approvals = Vec::new();
        let mut hats = Vec::new();
        let mut authorizations = Vec::new();
        for path in tree.entries.keys() {
            let Some(envelope) = self.read_envelope(&tree, path).await? else {
                continue;
            };
            match envelope.payload_type.as_str() {
                APPROVAL_PAYLOAD_TYPE => {
                    approvals.push(Attestation::PullRequestApproval(envelope.decode()?));
                },
                HAT_PAYLOAD_TYPE => hats.push(Attestation::Hat(envelope.decode()?)),
                REFERENCE_AUTHORIZATION_PAYLOAD_TYPE => {
                    authorizations.push(Attestation::ReferenceAuthorization(envelope.decode()?));
                },
                other => {
                    return Err(AttestationError::Invalid(format!(
                        "{path}: unknown payload type {other}"
                    )));
                },
            }
        }
        approvals.extend(hats);
        approvals.extend(authorizations);
        Ok(approvals)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
