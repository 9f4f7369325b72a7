//! A resolved, verified policy.

use std::collections::BTreeSet;

use reftrust_crypto::PublicKey;
use reftrust_rsl::EntryId;
use reftrust_storage::ObjectId;

use crate::error::PolicyResult;
use crate::metadata::{
    GlobalRule, Metadata, Principal, PropagationDirective, RootMetadata, Rule, TargetsMetadata,
};
use crate::pattern::PatternSet;

/// Separator between a controller name and a principal id.
pub const CONTROLLER_SEPARATOR: char = '/';

/// Policy of a controller repository, as seen from a delegating one.
#[derive(Debug, Clone)]
pub struct ControllerPolicy {
    /// Name the delegating root gives the controller.
    pub name: String,
    /// Location the controller was resolved from.
    pub location: String,
    /// The controller's own resolved policy.
    pub state: PolicyState,
}

/// A principal found by id, with the policy that registers it.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPrincipal<'a> {
    /// Id relative to the policy that registers it.
    pub local_id: &'a str,
    /// The principal.
    pub principal: &'a Principal,
    /// Policy the principal belongs to.
    pub owner: &'a PolicyState,
}

/// Root and rule-set in force at one point of the log.
#[derive(Debug, Clone)]
pub struct PolicyState {
    /// Log entry that recorded this policy, if any.
    pub entry_id: Option<EntryId>,
    /// Policy commit the documents were read from, if any.
    pub commit: Option<ObjectId>,
    /// Current root.
    pub root: RootMetadata,
    /// Current rule-set.
    pub targets: TargetsMetadata,
    /// Resolved controllers, in root order.
    pub controllers: Vec<ControllerPolicy>,
    pub(crate) genesis_root_keys: Vec<PublicKey>,
    rule_patterns: Vec<PatternSet>,
    global_patterns: Vec<PatternSet>,
}

impl PolicyState {
    /// Build a state from already verified documents.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::InvalidMetadata`] if either document is
    /// invalid.
    pub fn new(root: RootMetadata, targets: TargetsMetadata) -> PolicyResult<Self> {
        root.validate()?;
        targets.validate()?;
        let rule_patterns = targets
            .rules
            .iter()
            .map(|r| PatternSet::compile(&r.patterns))
            .collect::<PolicyResult<Vec<_>>>()?;
        let global_patterns = root
            .global_rules
            .iter()
            .map(|r| PatternSet::compile(r.patterns()))
            .collect::<PolicyResult<Vec<_>>>()?;
        Ok(Self {
            entry_id: None,
            commit: None,
            genesis_root_keys: root.root_keys.clone(),
            root,
            targets,
            controllers: Vec::new(),
            rule_patterns,
            global_patterns,
        })
    }

    /// Attach a resolved controller.
    #[must_use]
    pub fn with_controller(
        mut self,
        name: impl Into<String>,
        location: impl Into<String>,
        state: PolicyState,
    ) -> Self {
        self.controllers.push(ControllerPolicy {
            name: name.into(),
            location: location.into(),
            state,
        });
        self
    }

    pub(crate) fn located(mut self, entry_id: Option<EntryId>, commit: ObjectId) -> Self {
        self.entry_id = entry_id;
        self.commit = Some(commit);
        self
    }

    /// Root keys of the first root version in this policy's history.
    #[must_use]
    pub fn genesis_root_keys(&self) -> &[PublicKey] {
        &self.genesis_root_keys
    }

    // -----------------------------------------------------------------------
    // Principals
    // -----------------------------------------------------------------------

    /// Find a principal. Ids of the form `<controller>/<id>` are looked up
    /// in that controller's policy, recursively.
    #[must_use]
    pub fn resolve_principal<'a>(&'a self, id: &'a str) -> Option<ResolvedPrincipal<'a>> {
        if let Some((local_id, principal)) = self.targets.principals.get_key_value(id) {
            return Some(ResolvedPrincipal {
                local_id,
                principal,
                owner: self,
            });
        }
        let (controller, rest) = id.split_once(CONTROLLER_SEPARATOR)?;
        self.controllers
            .iter()
            .find(|c| c.name == controller)
            .and_then(|c| c.state.resolve_principal(rest))
    }

    /// Keys a principal signs with. A team's keys are its members' keys.
    #[must_use]
    pub fn principal_keys(&self, id: &str) -> Vec<PublicKey> {
        let Some(resolved) = self.resolve_principal(id) else {
            return Vec::new();
        };
        match resolved.principal {
            Principal::Team { members, .. } => {
                let keys: BTreeSet<PublicKey> = members
                    .iter()
                    .flat_map(|m| resolved.owner.principal_keys(m))
                    .collect();
                keys.into_iter().collect()
            },
            other => other.own_keys().to_vec(),
        }
    }

    /// Every key held by any principal here or in a controller.
    #[must_use]
    pub fn all_keys(&self) -> Vec<PublicKey> {
        let mut keys: BTreeSet<PublicKey> = self
            .targets
            .principals
            .values()
            .flat_map(|p| p.own_keys().iter().copied())
            .collect();
        for controller in &self.controllers {
            keys.extend(controller.state.all_keys());
        }
        keys.into_iter().collect()
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// First rule whose reference patterns match `ref_name`.
    #[must_use]
    pub fn rule_for_ref(&self, ref_name: &str) -> Option<&Rule> {
        self.targets
            .rules
            .iter()
            .zip(&self.rule_patterns)
            .find(|(_, patterns)| patterns.matches_ref(ref_name))
            .map(|(rule, _)| rule)
    }

    /// First rule whose file patterns match `path`.
    #[must_use]
    pub fn rule_for_path(&self, path: &str) -> Option<&Rule> {
        self.targets
            .rules
            .iter()
            .zip(&self.rule_patterns)
            .filter(|(_, patterns)| patterns.has_file_patterns())
            .find(|(_, patterns)| patterns.matches_path(path))
            .map(|(rule, _)| rule)
    }

    /// Global rules of this policy and every controller that apply to a
    /// change of `ref_name` touching `changed_paths`.
    #[must_use]
    pub fn global_rules_for<'a>(
        &'a self,
        ref_name: &str,
        changed_paths: &BTreeSet<String>,
    ) -> Vec<&'a GlobalRule> {
        let mut applicable: Vec<&GlobalRule> = self
            .root
            .global_rules
            .iter()
            .zip(&self.global_patterns)
            .filter(|(_, patterns)| {
                patterns.matches_ref(ref_name)
                    || changed_paths.iter().any(|p| patterns.matches_path(p))
            })
            .map(|(rule, _)| rule)
            .collect();
        for controller in &self.controllers {
            applicable.extend(controller.state.global_rules_for(ref_name, changed_paths));
        }
        applicable
    }

    /// Id of the principal in `rule` that holds the review app's key.
    #[must_use]
    pub fn app_principal<'a>(&self, rule: &'a Rule) -> Option<&'a str> {
        let app_key = self.root.github_app_key?;
        rule.principal_ids
            .iter()
            .find(|id| self.principal_keys(id).contains(&app_key))
            .map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    /// Directive named `name`.
    #[must_use]
    pub fn directive(&self, name: &str) -> Option<&PropagationDirective> {
        self.root.directive(name)
    }

    /// All directives, in declared order.
    #[must_use]
    pub fn directives(&self) -> &[PropagationDirective] {
        &self.root.propagation_directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reftrust_crypto::KeyPair;

    fn state() -> (PolicyState, KeyPair, KeyPair) {
        let root_key = KeyPair::generate();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let targets = TargetsMetadata::new()
            .with_principal("alice", Principal::person("alice", vec![alice.public_key()]))
            .with_principal("bob", Principal::key(bob.public_key()))
            .with_principal("core", Principal::team("core", ["alice", "bob"]))
            .with_rule(Rule::new("docs", ["file:docs/**"], ["alice"], 1))
            .with_rule(Rule::new("main", ["git:main"], ["alice", "bob"], 2))
            .with_rule(Rule::new("all", ["git:refs/heads/*"], ["bob"], 1));
        let root = RootMetadata::new(vec![root_key.public_key()], 1).with_global_rule(
            GlobalRule::BlockForcePushes {
                name: "no-rewrites".into(),
                patterns: vec!["git:main".into()],
            },
        );
        (PolicyState::new(root, targets).unwrap(), alice, bob)
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let (state, _, _) = state();
        assert_eq!(state.rule_for_ref("refs/heads/main").unwrap().name, "main");
        assert_eq!(state.rule_for_ref("refs/heads/dev").unwrap().name, "all");
        assert!(state.rule_for_ref("refs/tags/v1").is_none());
        assert_eq!(state.rule_for_path("docs/a/b.md").unwrap().name, "docs");
        assert!(state.rule_for_path("src/lib.rs").is_none());
    }

    #[test]
    fn test_team_keys_are_member_keys() {
        let (state, alice, bob) = state();
        let keys = state.principal_keys("core");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&alice.public_key()));
        assert!(keys.contains(&bob.public_key()));
        assert!(state.principal_keys("nobody").is_empty());
    }

    #[test]
    fn test_controller_principals_resolve_by_prefix() {
        let (local, _, _) = state();
        let (controller, alice, _) = state();
        let state = local.with_controller("org", "https://example.com/org", controller);

        let resolved = state.resolve_principal("org/alice").unwrap();
        assert_eq!(resolved.local_id, "alice");
        assert_eq!(state.principal_keys("org/alice"), vec![alice.public_key()]);
        assert!(state.resolve_principal("other/alice").is_none());
        assert_eq!(state.all_keys().len(), 4);

        // The controller's global rule applies here too.
        let rules = state.global_rules_for("refs/heads/main", &BTreeSet::new());
        assert_eq!(rules.len(), 2);
    }
}
