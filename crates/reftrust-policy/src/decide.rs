//! The authorization decision.
//!
//! [`decide`] is pure: given a policy and everything collected about one
//! change it always returns the same [`Decision`]. Collecting signatures
//! and attestations is the caller's job.
//!
//! A principal qualifies for a rule when it is listed in the rule and
//! one of the following holds:
//!
//! - one of its keys signed the change directly, or signed a reference
//!   authorization for exactly this move of the reference;
//! - the review app witnessed its approval (the app's key signed the
//!   approval, and the app is itself a principal of the rule);
//! - it is a team named by a hat attestation signed by one of its members.
//!   That member then counts only through the team.

use std::collections::{BTreeMap, BTreeSet};

use reftrust_attestations::{Attested, Hat, PullRequestApproval, ReferenceAuthorization};
use reftrust_core::absolute_reference;
use reftrust_crypto::KeyId;
use reftrust_storage::ObjectId;

use crate::metadata::{GlobalRule, Principal, Rule};
use crate::state::PolicyState;

/// Everything known about one change that bears on its authorization.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Reference being changed.
    pub ref_name: String,
    /// New target.
    pub target_id: ObjectId,
    /// Previously recorded target, if any.
    pub prior_target_id: Option<ObjectId>,
    /// Paths that differ between the prior and new target.
    pub changed_paths: BTreeSet<String>,
    /// Keys with a valid signature over the change.
    pub signer_keys: BTreeSet<KeyId>,
    /// Approval attestation for the change.
    pub approval: Option<Attested<PullRequestApproval>>,
    /// Hat attestation for the change.
    pub hat: Option<Attested<Hat>>,
    /// Reference authorization signed by approvers.
    pub reference_authorization: Option<Attested<ReferenceAuthorization>>,
    /// Whether the new target descends from the prior one.
    pub descends_from_prior: Option<bool>,
    /// Predict a merge instead of judging a recorded change.
    pub mergeable: bool,
}

impl AuthorizationRequest {
    /// Request for `ref_name` moving to `target_id` with nothing collected.
    #[must_use]
    pub fn new(ref_name: &str, target_id: ObjectId) -> Self {
        Self {
            ref_name: absolute_reference(ref_name),
            target_id,
            prior_target_id: None,
            changed_paths: BTreeSet::new(),
            signer_keys: BTreeSet::new(),
            approval: None,
            hat: None,
            reference_authorization: None,
            descends_from_prior: None,
            mergeable: false,
        }
    }

    /// Set the prior target.
    #[must_use]
    pub fn with_prior(mut self, prior: ObjectId) -> Self {
        self.prior_target_id = Some(prior);
        self
    }

    /// Set the changed paths.
    #[must_use]
    pub fn with_changed_paths(mut self, paths: BTreeSet<String>) -> Self {
        self.changed_paths = paths;
        self
    }

    /// Add keys that signed the change.
    #[must_use]
    pub fn with_signers(mut self, keys: impl IntoIterator<Item = KeyId>) -> Self {
        self.signer_keys.extend(keys);
        self
    }

    /// Attach an approval attestation.
    #[must_use]
    pub fn with_approval(mut self, approval: Attested<PullRequestApproval>) -> Self {
        self.approval = Some(approval);
        self
    }

    /// Attach a hat attestation.
    #[must_use]
    pub fn with_hat(mut self, hat: Attested<Hat>) -> Self {
        self.hat = Some(hat);
        self
    }

    /// Attach a reference authorization.
    #[must_use]
    pub fn with_reference_authorization(
        mut self,
        authorization: Attested<ReferenceAuthorization>,
    ) -> Self {
        self.reference_authorization = Some(authorization);
        self
    }

    /// Record whether the new target descends from the prior one.
    #[must_use]
    pub fn with_ancestry(mut self, descends: bool) -> Self {
        self.descends_from_prior = Some(descends);
        self
    }

    /// Treat the request as a merge prediction.
    #[must_use]
    pub fn as_prediction(mut self) -> Self {
        self.mergeable = true;
        self
    }
}

/// Which part of the policy a rule outcome comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    /// The rule governing the reference.
    Reference,
    /// The file rule governing a changed path.
    Path(String),
    /// A global rule.
    Global,
}

/// How one rule judged the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    /// Rule name.
    pub rule: String,
    /// Where the rule comes from.
    pub scope: RuleScope,
    /// Principals required (after any merge allowance).
    pub threshold: usize,
    /// Principals that qualified.
    pub qualifying: BTreeSet<String>,
    /// Whether the rule is satisfied.
    pub satisfied: bool,
}

/// Verdict for one change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Whether every applicable rule is satisfied.
    pub authorized: bool,
    /// For predictions: the change passes only if whoever merges it is an
    /// authorized principal.
    pub needs_authorized_merger: bool,
    /// Per-rule outcomes, reference rule first.
    pub outcomes: Vec<RuleOutcome>,
    /// Why the change is not authorized.
    pub reasons: Vec<String>,
}

impl Decision {
    /// Qualifying principals of the reference rule.
    #[must_use]
    pub fn qualifying(&self) -> BTreeSet<String> {
        self.outcomes
            .iter()
            .find(|o| o.scope == RuleScope::Reference)
            .map(|o| o.qualifying.clone())
            .unwrap_or_default()
    }

    fn record(&mut self, outcome: RuleOutcome) {
        if !outcome.satisfied {
            let at = match &outcome.scope {
                RuleScope::Path(path) => format!(" for {path}"),
                RuleScope::Reference | RuleScope::Global => String::new(),
            };
            self.reasons.push(format!(
                "rule '{}'{at} needs {} principal(s), found {}",
                outcome.rule,
                outcome.threshold,
                outcome.qualifying.len()
            ));
        }
        self.outcomes.push(outcome);
    }
}

/// Decide whether `request` is authorized under `state`.
#[must_use]
pub fn decide(state: &PolicyState, request: &AuthorizationRequest) -> Decision {
    let mut decision = Decision::default();
    let Some(rule) = state.rule_for_ref(&request.ref_name) else {
        decision
            .reasons
            .push(format!("no rule protects {}", request.ref_name));
        return decision;
    };

    let ref_qualifying = qualifying(state, rule, request);
    let count = ref_qualifying.len();
    let mut allowance = 0;
    let satisfied = if count >= rule.threshold {
        true
    } else if request.mergeable && count.saturating_add(1) == rule.threshold {
        decision.needs_authorized_merger = true;
        allowance = 1;
        true
    } else {
        false
    };
    decision.record(RuleOutcome {
        rule: rule.name.clone(),
        scope: RuleScope::Reference,
        threshold: rule.threshold,
        qualifying: ref_qualifying,
        satisfied,
    });

    let mut by_rule: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for path in &request.changed_paths {
        let Some(file_rule) = state.rule_for_path(path) else {
            continue;
        };
        let found = by_rule
            .entry(file_rule.name.as_str())
            .or_insert_with(|| qualifying(state, file_rule, request))
            .clone();
        decision.record(RuleOutcome {
            rule: file_rule.name.clone(),
            scope: RuleScope::Path(path.clone()),
            threshold: file_rule.threshold,
            satisfied: found.len() >= file_rule.threshold,
            qualifying: found,
        });
    }

    let ref_qualifying = decision.qualifying();
    for global in state.global_rules_for(&request.ref_name, &request.changed_paths) {
        match global {
            GlobalRule::Threshold {
                name, threshold, ..
            } => {
                let threshold = threshold.saturating_sub(allowance);
                decision.record(RuleOutcome {
                    rule: name.clone(),
                    scope: RuleScope::Global,
                    threshold,
                    satisfied: ref_qualifying.len() >= threshold,
                    qualifying: ref_qualifying.clone(),
                });
            },
            GlobalRule::BlockForcePushes { name, .. } => {
                if request.mergeable {
                    continue;
                }
                let satisfied = request.descends_from_prior != Some(false);
                if !satisfied {
                    decision
                        .reasons
                        .push(format!("rule '{name}' forbids rewriting history"));
                }
                decision.outcomes.push(RuleOutcome {
                    rule: name.clone(),
                    scope: RuleScope::Global,
                    threshold: 0,
                    qualifying: BTreeSet::new(),
                    satisfied,
                });
            },
        }
    }

    decision.authorized = decision.outcomes.iter().all(|o| o.satisfied);
    decision
}

/// Principals of `rule` that qualify for `request`.
fn qualifying(state: &PolicyState, rule: &Rule, request: &AuthorizationRequest) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut absorbed = BTreeSet::new();
    let app_principal = state.app_principal(rule);
    let authorizers = authorization_signers(state, request);

    if let Some(hat) = request
        .hat
        .as_ref()
        .filter(|h| h.value.ref_name == request.ref_name && h.value.target_id == request.target_id)
    {
        count_hat(state, rule, hat, &mut found, &mut absorbed);
    }

    for id in &rule.principal_ids {
        if absorbed.contains(id) || Some(id.as_str()) == app_principal {
            continue;
        }
        let Some(resolved) = state.resolve_principal(id) else {
            continue;
        };
        if resolved
            .principal
            .own_keys()
            .iter()
            .any(|k| {
                let id = k.key_id();
                request.signer_keys.contains(&id) || authorizers.contains(&id)
            })
        {
            found.insert(id.clone());
        }
    }

    if let (Some(app_id), Some(approval)) = (app_principal, request.approval.as_ref()) {
        if witnessed(state, request, approval) {
            for approver in approval
                .value
                .approvers
                .iter()
                .filter(|a| !approval.value.dismissed_approvers.contains(*a))
            {
                for id in &rule.principal_ids {
                    if id == app_id || absorbed.contains(id) {
                        continue;
                    }
                    if approver_is(state, id, approver) {
                        found.insert(id.clone());
                    }
                }
            }
        }
    }
    found
}

fn count_hat(
    state: &PolicyState,
    rule: &Rule,
    hat: &Attested<Hat>,
    found: &mut BTreeSet<String>,
    absorbed: &mut BTreeSet<String>,
) {
    let team_id = &hat.value.team_id;
    if !rule.principal_ids.contains(team_id) {
        return;
    }
    let Some(resolved) = state.resolve_principal(team_id) else {
        return;
    };
    let Principal::Team { members, .. } = resolved.principal else {
        return;
    };
    let prefix = team_id
        .strip_suffix(resolved.local_id)
        .unwrap_or_default();
    for member in members {
        let keys = resolved.owner.principal_keys(member);
        if !hat.envelope.valid_signers(&keys).is_empty() {
            found.insert(team_id.clone());
            absorbed.insert(format!("{prefix}{member}"));
        }
    }
}

/// Keys that validly signed a reference authorization for this exact move.
fn authorization_signers(state: &PolicyState, request: &AuthorizationRequest) -> BTreeSet<KeyId> {
    request
        .reference_authorization
        .as_ref()
        .filter(|a| {
            a.value
                .covers(&request.ref_name, request.prior_target_id, request.target_id)
        })
        .map(|a| a.envelope.valid_signers(&state.all_keys()))
        .unwrap_or_default()
}

/// Whether the approval is for this exact change and signed by the app.
fn witnessed(
    state: &PolicyState,
    request: &AuthorizationRequest,
    approval: &Attested<PullRequestApproval>,
) -> bool {
    let Some(app_key) = state.root.github_app_key else {
        return false;
    };
    let value = &approval.value;
    value.ref_name == request.ref_name
        && value.target_id == request.target_id
        && request
            .prior_target_id
            .is_none_or(|prior| prior == value.prior_target_id)
        && approval
            .envelope
            .valid_signers(&[app_key])
            .contains(&app_key.key_id())
}

fn approver_is(state: &PolicyState, principal_id: &str, approver: &str) -> bool {
    let Some(resolved) = state.resolve_principal(principal_id) else {
        return false;
    };
    match resolved.principal {
        Principal::Team { .. } => false,
        Principal::Person {
            associated_identities,
            ..
        } => {
            principal_id == approver
                || associated_identities
                    .get(&state.root.github_app_name)
                    .is_some_and(|identity| identity == approver)
        },
        Principal::Key { .. } => principal_id == approver,
    }
}

#[cfg(test)]
#[path = "decide_tests.rs"]
mod tests;
