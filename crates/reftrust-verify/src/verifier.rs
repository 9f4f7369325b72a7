//! The verification orchestrator.
//!
//! Every verification runs the same linear pipeline:
//!
//! ```text
//! ResolveRslState -> ResolvePolicy -> CollectAuthorizers -> Decide
//! ```
//!
//! `ResolveRslState` optionally pulls the log from a remote. `ResolvePolicy`
//! loads the policy in force at the entry being verified. `CollectAuthorizers`
//! gathers entry and commit signatures, attestations (approvals, hats and
//! reference authorizations), changed paths and ancestry into an
//! [`AuthorizationRequest`]. `Decide` hands that request to
//! [`decide`], which is pure.

use std::sync::Arc;

use reftrust_attestations::{
    AttestationError, AttestationStore, Attested, Hat, PullRequestApproval, ReferenceAuthorization,
};
use reftrust_core::{Mode, ModeContext, absolute_reference};
use reftrust_crypto::ContentHash;
use reftrust_policy::{
    AuthorizationRequest, Decision, PolicyError, PolicyState, PolicyStore, PropagationDirective,
    decide,
};
use reftrust_rsl::{
    EntryBody, EntryId, LatestEntryOptions, ReferenceStateLog, RemoteLog, RslEntry, RslError,
};
use reftrust_storage::{ObjectId, Tree};
use reftrust_telemetry::RequestContext;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{VerifyError, VerifyResult};

#[derive(Debug, Clone, Copy)]
enum Stage {
    ResolveRslState,
    ResolvePolicy,
    CollectAuthorizers,
    Decide,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::ResolveRslState => "resolve-rsl-state",
            Self::ResolvePolicy => "resolve-policy",
            Self::CollectAuthorizers => "collect-authorizers",
            Self::Decide => "decide",
        }
    }

    fn enter(self) {
        debug!(stage = self.as_str(), "Verification stage");
    }
}

/// Options shared by every verification call.
#[derive(Clone, Default)]
pub struct VerifyOptions<'a> {
    /// Pull the log from this remote before verifying.
    pub remote: Option<&'a dyn RemoteLog>,
    /// Aborts the remote pull.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for VerifyOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyOptions")
            .field("remote", &self.remote.map(|r| r.name()))
            .finish_non_exhaustive()
    }
}

impl<'a> VerifyOptions<'a> {
    /// Sync from `remote` first.
    #[must_use]
    pub fn with_remote(mut self, remote: &'a dyn RemoteLog) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use `cancel` for the remote pull.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of verifying one reference state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Reference verified.
    pub ref_name: String,
    /// Target verified.
    pub target_id: ObjectId,
    /// Log entry verified. `None` for predictions.
    pub entry_id: Option<EntryId>,
    /// Policy entry the verdict was reached under.
    pub policy_entry_id: Option<EntryId>,
    /// Whether this is a merge prediction rather than a recorded verdict.
    pub prediction: bool,
    /// Directive that produced the state, for propagation entries.
    pub propagated_by: Option<String>,
    /// The decision.
    pub decision: Decision,
}

impl Verdict {
    /// Whether the state is authorized.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.decision.authorized
    }

    /// Turn a negative verdict into [`VerifyError::Unauthorized`].
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Unauthorized`] carrying the decision's reasons.
    pub fn ensure_authorized(self) -> VerifyResult<Self> {
        if self.is_authorized() {
            Ok(self)
        } else {
            Err(VerifyError::Unauthorized {
                ref_name: self.ref_name,
                reasons: self.decision.reasons,
            })
        }
    }
}

/// Answers "is reference R at target T authorized?".
pub struct Verifier {
    rsl: Arc<ReferenceStateLog>,
    policy: PolicyStore,
    attestations: AttestationStore,
    mode: ModeContext,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("rsl", &self.rsl.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// Verifier over the repository behind `policy`.
    #[must_use]
    pub fn new(policy: PolicyStore, mode: ModeContext) -> Self {
        let rsl = Arc::clone(policy.rsl());
        Self {
            attestations: AttestationStore::new(Arc::clone(&rsl), mode),
            rsl,
            policy,
            mode,
        }
    }

    fn context(operation: &str, ref_name: &str) -> RequestContext {
        RequestContext::new("verifier")
            .with_operation(operation)
            .with_ref(ref_name)
    }

    /// Verify the latest unskipped entry of `ref_name`, and that the
    /// reference tip is the state it records.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::NoEntry`] if the log does not record the
    /// reference, [`VerifyError::TipNotRecorded`] if the tip moved without
    /// an entry, or the error of any stage.
    pub async fn verify_ref(&self, ref_name: &str, opts: &VerifyOptions<'_>) -> VerifyResult<Verdict> {
        let ref_name = absolute_reference(ref_name);
        let ctx = Self::context("verify-ref", &ref_name);
        async {
            self.resolve_rsl_state(opts).await?;
            let entry = self.latest_entry(&ref_name).await?.ok_or_else(|| VerifyError::NoEntry(ref_name.clone()))?;
            let verdict = self.verify_entry(&ref_name, &entry).await?;
            if let Some(tip) = self.rsl.repository().ref_tip(&ref_name).await?
                && tip != verdict.target_id
            {
                warn!(tip = %tip.short(), "Reference tip is not recorded in the log");
                return Err(VerifyError::TipNotRecorded {
                    ref_name: ref_name.clone(),
                    tip: tip.to_hex(),
                });
            }
            info!(authorized = verdict.is_authorized(), elapsed_ms = ctx.elapsed_ms(), "Verified reference");
            Ok(verdict)
        }
        .instrument(ctx.span())
        .await
    }

    /// Verify every unskipped entry of `ref_name`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the first error of any stage. Negative verdicts are
    /// returned, not raised.
    pub async fn verify_ref_history(&self, ref_name: &str, opts: &VerifyOptions<'_>) -> VerifyResult<Vec<Verdict>> {
        let ref_name = absolute_reference(ref_name);
        let ctx = Self::context("verify-ref-history", &ref_name);
        async {
            self.resolve_rsl_state(opts).await?;
            let entries = self.unskipped_entries(&ref_name).await?;
            let verdicts = self.verify_entries(&ref_name, &entries).await?;
            info!(entries = verdicts.len(), elapsed_ms = ctx.elapsed_ms(), "Verified reference history");
            Ok(verdicts)
        }
        .instrument(ctx.span())
        .await
    }

    /// Verify the entry that brought `commit` into `ref_name`: the latest
    /// entry recording it, or else the earliest entry whose target contains
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::CommitNotRecorded`] if no entry records or
    /// contains the commit.
    pub async fn verify_commit(
        &self,
        ref_name: &str,
        commit: ObjectId,
        opts: &VerifyOptions<'_>,
    ) -> VerifyResult<Verdict> {
        let ref_name = absolute_reference(ref_name);
        let ctx = Self::context("verify-commit", &ref_name).with_metadata("commit", commit.to_hex());
        async {
            self.resolve_rsl_state(opts).await?;
            let entries = self.unskipped_entries(&ref_name).await?;
            let mut found = entries.iter().rev().find(|e| e.target_id() == Some(commit));
            if found.is_none() {
                let repo = self.rsl.repository();
                for entry in &entries {
                    let Some(target) = entry.target_id() else {
                        continue;
                    };
                    if repo.is_ancestor(&commit, &target).await? {
                        found = Some(entry);
                        break;
                    }
                }
            }
            let entry = found.ok_or_else(|| VerifyError::CommitNotRecorded {
                ref_name: ref_name.clone(),
                commit: commit.to_hex(),
            })?;
            self.verify_entry(&ref_name, entry).await
        }
        .instrument(ctx.span())
        .await
    }

    /// Predict whether merging `feature` into `base` now would be
    /// authorized. Never writes to the log.
    ///
    /// With `bypass_rsl` the feature's live tip is used even if the log has
    /// no entry for it. A prediction may come back authorized with
    /// `needs_authorized_merger` set: the merge passes only if whoever
    /// records it is an authorized principal.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::NoEntry`] without `bypass_rsl` if the log
    /// does not record the feature, [`VerifyError::NoTip`] with it if the
    /// feature reference does not exist, or the error of any stage.
    pub async fn verify_mergeable(
        &self,
        base: &str,
        feature: &str,
        bypass_rsl: bool,
        opts: &VerifyOptions<'_>,
    ) -> VerifyResult<Verdict> {
        let base = absolute_reference(base);
        let feature = absolute_reference(feature);
        let ctx = Self::context("verify-mergeable", &base).with_metadata("feature", feature.clone());
        async {
            self.resolve_rsl_state(opts).await?;
            let repo = self.rsl.repository();

            Stage::ResolvePolicy.enter();
            let state = self.policy.load_latest().await?;

            Stage::CollectAuthorizers.enter();
            let base_target = match self.latest_entry(&base).await? {
                Some(entry) => entry.target_id(),
                None => repo.ref_tip(&base).await?,
            };
            let feature_entry = if bypass_rsl {
                None
            } else {
                Some(
                    self.latest_entry(&feature)
                        .await?
                        .ok_or_else(|| VerifyError::NoEntry(feature.clone()))?,
                )
            };
            let feature_target = match feature_entry.as_ref().and_then(RslEntry::target_id) {
                Some(target) => target,
                None => repo
                    .ref_tip(&feature)
                    .await?
                    .ok_or_else(|| VerifyError::NoTip(feature.clone()))?,
            };
            let mut request = self.collect(&state, &base, feature_target, base_target).await?;
            if let Some(entry) = &feature_entry {
                request = request.with_signers(entry.valid_signers(&state.all_keys()));
            }

            Stage::Decide.enter();
            let decision = decide(&state, &request.as_prediction());
            info!(
                authorized = decision.authorized,
                needs_authorized_merger = decision.needs_authorized_merger,
                elapsed_ms = ctx.elapsed_ms(),
                "Predicted merge"
            );
            Ok(Verdict {
                ref_name: base.clone(),
                target_id: feature_target,
                entry_id: None,
                policy_entry_id: state.entry_id,
                prediction: true,
                propagated_by: None,
                decision,
            })
        }
        .instrument(ctx.span())
        .await
    }

    /// Verify `ref_name` from `entry_id` onward, ignoring earlier history.
    /// Only available in developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Mode`] outside developer mode and
    /// [`VerifyError::EntryMismatch`] if the entry records another
    /// reference.
    pub async fn verify_ref_from_entry(
        &self,
        ref_name: &str,
        entry_id: &EntryId,
        opts: &VerifyOptions<'_>,
    ) -> VerifyResult<Vec<Verdict>> {
        self.mode.require(Mode::Developer, "verify-ref-from-entry")?;
        let ref_name = absolute_reference(ref_name);
        let ctx = Self::context("verify-ref-from-entry", &ref_name).with_metadata("entry", entry_id.to_hex());
        async {
            self.resolve_rsl_state(opts).await?;
            let start = self.rsl.get_entry(entry_id).await?;
            if start.ref_name() != Some(ref_name.as_str()) {
                return Err(VerifyError::EntryMismatch {
                    entry: entry_id.to_hex(),
                    ref_name: ref_name.clone(),
                });
            }
            let entries: Vec<RslEntry> = self
                .unskipped_entries(&ref_name)
                .await?
                .into_iter()
                .filter(|e| e.number >= start.number)
                .collect();
            self.verify_entries(&ref_name, &entries).await
        }
        .instrument(ctx.span())
        .await
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    async fn resolve_rsl_state(&self, opts: &VerifyOptions<'_>) -> VerifyResult<()> {
        Stage::ResolveRslState.enter();
        if let Some(remote) = opts.remote {
            let outcome = self.rsl.pull(remote, &opts.cancel).await?;
            debug!(remote = remote.name(), ?outcome, "Synced log before verifying");
        }
        Ok(())
    }

    async fn latest_entry(&self, ref_name: &str) -> VerifyResult<Option<RslEntry>> {
        match self
            .rsl
            .get_latest_entry(ref_name, &LatestEntryOptions::unskipped())
            .await
        {
            Ok(entry) => Ok(Some(entry)),
            Err(RslError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn unskipped_entries(&self, ref_name: &str) -> VerifyResult<Vec<RslEntry>> {
        let mut entries = Vec::new();
        for entry in self.rsl.entries_for(ref_name).await? {
            if !self.rsl.is_skipped(&entry.id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn verify_entries(&self, ref_name: &str, entries: &[RslEntry]) -> VerifyResult<Vec<Verdict>> {
        let mut verdicts = Vec::with_capacity(entries.len());
        for entry in entries {
            verdicts.push(self.verify_entry(ref_name, entry).await?);
        }
        Ok(verdicts)
    }

    async fn verify_entry(&self, ref_name: &str, entry: &RslEntry) -> VerifyResult<Verdict> {
        let target = entry.target_id().ok_or_else(|| VerifyError::EntryMismatch {
            entry: entry.id.to_hex(),
            ref_name: ref_name.to_string(),
        })?;

        Stage::ResolvePolicy.enter();
        let state = self.policy.load_at(&entry.id).await?;

        Stage::CollectAuthorizers.enter();
        let prior = match self
            .rsl
            .get_latest_entry(ref_name, &LatestEntryOptions::unskipped().before(entry.id))
            .await
        {
            Ok(previous) => previous.target_id(),
            Err(RslError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if let EntryBody::Propagation {
            upstream_repository,
            upstream_entry_id,
            directive,
            content_digest,
            ..
        } = &entry.body
        {
            let claim = PropagationClaim {
                directive,
                upstream_repository,
                upstream_entry_id: *upstream_entry_id,
                content_digest: *content_digest,
            };
            let decision = self
                .check_propagation(&state, ref_name, target, prior, &claim)
                .await?;
            if !decision.authorized {
                warn!(entry_id = %entry.id.short(), reasons = ?decision.reasons, "Propagation entry is not authorized");
            }
            return Ok(Verdict {
                ref_name: ref_name.to_string(),
                target_id: target,
                entry_id: Some(entry.id),
                policy_entry_id: state.entry_id,
                prediction: false,
                propagated_by: Some(directive.clone()),
                decision,
            });
        }

        let request = self
            .collect(&state, ref_name, target, prior)
            .await?
            .with_signers(entry.valid_signers(&state.all_keys()));

        Stage::Decide.enter();
        let decision = decide(&state, &request);
        if !decision.authorized {
            warn!(entry_id = %entry.id.short(), reasons = ?decision.reasons, "Entry is not authorized");
        }
        Ok(Verdict {
            ref_name: ref_name.to_string(),
            target_id: target,
            entry_id: Some(entry.id),
            policy_entry_id: state.entry_id,
            prediction: false,
            propagated_by: None,
            decision,
        })
    }

    /// Everything but entry signatures for `ref_name` moving from `prior`
    /// to `target`.
    async fn collect(
        &self,
        state: &PolicyState,
        ref_name: &str,
        target: ObjectId,
        prior: Option<ObjectId>,
    ) -> VerifyResult<AuthorizationRequest> {
        let repo = self.rsl.repository();
        let commit = repo.objects().get_commit(&target).await?;
        let new_tree = repo.objects().get_tree(&commit.tree).await?;
        let old_tree = match prior {
            Some(prior) => repo.tree_at(&prior).await?,
            None => Tree::new(),
        };
        let mut request = AuthorizationRequest::new(ref_name, target)
            .with_signers(commit.valid_signers(&state.all_keys()))
            .with_changed_paths(Tree::changed_paths(&old_tree, &new_tree));
        if let Some(prior) = prior {
            request = request
                .with_prior(prior)
                .with_ancestry(repo.is_ancestor(&prior, &target).await?);
        }
        if let Some(approval) = self.approval(ref_name, target).await? {
            request = request.with_approval(approval);
        }
        if let Some(hat) = self.hat(ref_name, target).await? {
            request = request.with_hat(hat);
        }
        if let Some(authorization) = self.reference_authorization(ref_name, prior, target).await? {
            request = request.with_reference_authorization(authorization);
        }
        Ok(request)
    }

    async fn approval(
        &self,
        ref_name: &str,
        target: ObjectId,
    ) -> VerifyResult<Option<Attested<PullRequestApproval>>> {
        match self.attestations.lookup(ref_name, target).await {
            Ok(approval) => Ok(Some(approval)),
            Err(AttestationError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn hat(&self, ref_name: &str, target: ObjectId) -> VerifyResult<Option<Attested<Hat>>> {
        match self.attestations.lookup_hat(ref_name, target).await {
            Ok(hat) => Ok(Some(hat)),
            Err(AttestationError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn reference_authorization(
        &self,
        ref_name: &str,
        prior: Option<ObjectId>,
        target: ObjectId,
    ) -> VerifyResult<Option<Attested<ReferenceAuthorization>>> {
        match self
            .attestations
            .lookup_reference_authorization(ref_name, prior, target)
            .await
        {
            Ok(authorization) => Ok(Some(authorization)),
            Err(AttestationError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A propagation entry is authorized by its directive instead of by
    /// signatures. The directive must be in force for this reference and
    /// upstream, the change must stay inside the downstream path, and the
    /// recorded digest must match both the downstream content and the
    /// upstream entry it names.
    async fn check_propagation(
        &self,
        state: &PolicyState,
        ref_name: &str,
        target: ObjectId,
        prior: Option<ObjectId>,
        claim: &PropagationClaim<'_>,
    ) -> VerifyResult<Decision> {
        let Some(directive) = state.directive(claim.directive) else {
            return Ok(propagation_decision(vec![format!(
                "directive '{}' is not in the policy",
                claim.directive
            )]));
        };
        let mut reasons = Vec::new();
        if absolute_reference(&directive.downstream_reference) != ref_name {
            reasons.push(format!("directive '{}' does not write {ref_name}", directive.name));
        }
        if directive.upstream_repository != claim.upstream_repository {
            reasons.push(format!(
                "directive '{}' does not read from {}",
                directive.name, claim.upstream_repository
            ));
        }

        let repo = self.rsl.repository();
        let new_tree = repo.tree_at(&target).await?;
        if new_tree.subtree(&directive.downstream_path).id() != claim.content_digest {
            reasons.push(format!(
                "content under {} does not match the propagated digest",
                directive.downstream_path
            ));
        }
        let old_tree = match prior {
            Some(prior) => repo.tree_at(&prior).await?,
            None => Tree::new(),
        };
        let outside: Vec<String> = Tree::changed_paths(&old_tree, &new_tree)
            .into_iter()
            .filter(|path| !within(path, &directive.downstream_path))
            .collect();
        if !outside.is_empty() {
            reasons.push(format!(
                "propagation changes paths outside {}: {}",
                directive.downstream_path,
                outside.join(", ")
            ));
        }

        if let Some(reason) = self.check_upstream(directive, claim).await? {
            reasons.push(reason);
        }
        Ok(propagation_decision(reasons))
    }

    /// Why the upstream entry named by `claim` does not back it, if it
    /// does not.
    async fn check_upstream(
        &self,
        directive: &PropagationDirective,
        claim: &PropagationClaim<'_>,
    ) -> VerifyResult<Option<String>> {
        let Some(resolver) = self.policy.resolver() else {
            return Ok(Some(format!(
                "upstream {} cannot be reached without a repository resolver",
                directive.upstream_repository
            )));
        };
        let upstream = match resolver.resolve(&directive.upstream_repository).await {
            Ok(log) => log,
            Err(PolicyError::RepositoryNotFound(location)) => {
                return Ok(Some(format!("upstream {location} cannot be resolved")));
            },
            Err(e) => return Err(e.into()),
        };
        let id = claim.upstream_entry_id;
        let entry = match upstream.get_entry(&id).await {
            Ok(entry) => entry,
            Err(RslError::EntryNotFound(_)) => {
                return Ok(Some(format!(
                    "upstream entry {} does not exist in {}",
                    id.short(),
                    directive.upstream_repository
                )));
            },
            Err(e) => return Err(e.into()),
        };
        let upstream_ref = absolute_reference(&directive.upstream_reference);
        let commit = match entry.target_id() {
            Some(commit) if entry.ref_name() == Some(upstream_ref.as_str()) => commit,
            _ => {
                return Ok(Some(format!(
                    "upstream entry {} does not record {upstream_ref}",
                    id.short()
                )));
            },
        };
        if upstream.is_skipped(&id).await? {
            return Ok(Some(format!("upstream entry {} is skipped", id.short())));
        }
        let tree = upstream.repository().tree_at(&commit).await?;
        if tree.subtree(&directive.upstream_path).id() != claim.content_digest {
            return Ok(Some(format!(
                "upstream content under {} at {} does not match the propagated digest",
                directive.upstream_path,
                id.short()
            )));
        }
        Ok(None)
    }
}

/// What a propagation entry asserts about where its content came from.
struct PropagationClaim<'a> {
    directive: &'a str,
    upstream_repository: &'a str,
    upstream_entry_id: EntryId,
    content_digest: ContentHash,
}

fn propagation_decision(reasons: Vec<String>) -> Decision {
    Decision {
        authorized: reasons.is_empty(),
        reasons,
        ..Decision::default()
    }
}

/// Whether `path` lies under the directory `dir`.
fn within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_matches('/');
    dir.is_empty() || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;
