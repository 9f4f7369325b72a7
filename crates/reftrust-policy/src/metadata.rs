//! Root-of-trust and rule-set metadata documents.
//!
//! Both documents travel inside signed [`Envelope`]s on the policy
//! reference. The root is signed by root keys, the rule set ("targets") by
//! policy keys named in the root.

use std::collections::{BTreeMap, BTreeSet};

use reftrust_crypto::{Envelope, KeyId, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, PolicyResult};
use crate::pattern::Pattern;

/// Payload type of root envelopes.
pub const ROOT_PAYLOAD_TYPE: &str = "application/vnd.reftrust.root+json";

/// Payload type of rule-set envelopes.
pub const TARGETS_PAYLOAD_TYPE: &str = "application/vnd.reftrust.targets+json";

/// Identity name under which app-witnessed approvers are recorded when the
/// root does not name the app.
pub const DEFAULT_APP_NAME: &str = "github-app";

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn check_threshold(field: &str, threshold: usize, keys: &[PublicKey]) -> PolicyResult<()> {
    let distinct: BTreeSet<KeyId> = keys.iter().map(PublicKey::key_id).collect();
    if threshold == 0 || threshold > distinct.len() {
        return Err(PolicyError::InvalidMetadata(format!(
            "{field} {threshold} is outside 1..={}",
            distinct.len()
        )));
    }
    Ok(())
}

/// A signed metadata document.
pub trait Metadata: Serialize + serde::de::DeserializeOwned {
    /// Envelope payload type.
    const PAYLOAD_TYPE: &'static str;

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidMetadata`] describing the first problem.
    fn validate(&self) -> PolicyResult<()>;

    /// Wrap in an envelope signed by every key in `signers`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is invalid or cannot be encoded.
    fn seal(&self, signers: &[&KeyPair]) -> PolicyResult<Envelope> {
        self.validate()?;
        let mut envelope = Envelope::from_json(Self::PAYLOAD_TYPE, self)?;
        for signer in signers {
            envelope.sign(signer);
        }
        Ok(envelope)
    }

    /// Decode and validate the document carried by `envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidMetadata`] on a payload type mismatch
    /// or an invalid document.
    fn open(envelope: &Envelope) -> PolicyResult<Self> {
        if envelope.payload_type != Self::PAYLOAD_TYPE {
            return Err(PolicyError::InvalidMetadata(format!(
                "expected {}, found {}",
                Self::PAYLOAD_TYPE,
                envelope.payload_type
            )));
        }
        let value: Self = envelope.decode()?;
        value.validate()?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Rule evaluated for every matching change in addition to the rule-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlobalRule {
    /// Minimum number of qualifying principals.
    Threshold {
        /// Rule name.
        name: String,
        /// Patterns the rule applies to.
        patterns: Vec<String>,
        /// Required qualifying principals.
        threshold: usize,
    },
    /// The new target must descend from the previously recorded one.
    BlockForcePushes {
        /// Rule name.
        name: String,
        /// Patterns the rule applies to.
        patterns: Vec<String>,
    },
}

impl GlobalRule {
    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Threshold { name, .. } | Self::BlockForcePushes { name, .. } => name,
        }
    }

    /// Patterns the rule applies to.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        match self {
            Self::Threshold { patterns, .. } | Self::BlockForcePushes { patterns, .. } => patterns,
        }
    }
}

/// Declares that content under an upstream path is copied into this
/// repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationDirective {
    /// Unique name within one policy version.
    pub name: String,
    /// Location of the upstream repository.
    pub upstream_repository: String,
    /// Upstream reference read from.
    pub upstream_reference: String,
    /// Upstream path (empty for the whole tree).
    pub upstream_path: String,
    /// Downstream reference written to.
    pub downstream_reference: String,
    /// Downstream path the content lands under.
    pub downstream_path: String,
}

/// A repository this one delegates policy authority to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRepository {
    /// Name used to prefix the controller's principals (`<name>/<id>`).
    pub name: String,
    /// Location handed to the repository resolver.
    pub location: String,
    /// Root keys the controller's genesis root must carry.
    pub initial_root_principals: Vec<PublicKey>,
}

/// A repository this one controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRepository {
    /// Display name.
    pub name: String,
    /// Location the repository identifies itself by.
    pub location: String,
}

/// Root of trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// Keys allowed to sign root versions.
    pub root_keys: Vec<PublicKey>,
    /// Root signatures required.
    pub root_threshold: usize,
    /// Keys allowed to sign the rule-set.
    pub policy_keys: Vec<PublicKey>,
    /// Rule-set signatures required.
    pub policy_threshold: usize,
    /// Key of the review app whose witnessed approvals may count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_app_key: Option<PublicKey>,
    /// Identity name the app's approvers are known under.
    #[serde(default = "default_app_name")]
    pub github_app_name: String,
    /// Rules applied on top of the rule-set, in order.
    #[serde(default)]
    pub global_rules: Vec<GlobalRule>,
    /// Content copied in from upstream repositories.
    #[serde(default)]
    pub propagation_directives: Vec<PropagationDirective>,
    /// Repositories this one delegates to.
    #[serde(default)]
    pub controller_repositories: Vec<ControllerRepository>,
    /// Repositories this one controls.
    #[serde(default)]
    pub network_repositories: Vec<NetworkRepository>,
}

impl RootMetadata {
    /// Version-1 root whose keys sign both root and rule-set.
    #[must_use]
    pub fn new(root_keys: Vec<PublicKey>, root_threshold: usize) -> Self {
        Self {
            version: 1,
            policy_keys: root_keys.clone(),
            policy_threshold: root_threshold,
            root_keys,
            root_threshold,
            github_app_key: None,
            github_app_name: default_app_name(),
            global_rules: Vec::new(),
            propagation_directives: Vec::new(),
            controller_repositories: Vec::new(),
            network_repositories: Vec::new(),
        }
    }

    /// Use a separate key set for the rule-set.
    #[must_use]
    pub fn with_policy_keys(mut self, keys: Vec<PublicKey>, threshold: usize) -> Self {
        self.policy_keys = keys;
        self.policy_threshold = threshold;
        self
    }

    /// Trust a review app.
    #[must_use]
    pub fn with_app_key(mut self, key: PublicKey) -> Self {
        self.github_app_key = Some(key);
        self
    }

    /// Append a global rule.
    #[must_use]
    pub fn with_global_rule(mut self, rule: GlobalRule) -> Self {
        self.global_rules.push(rule);
        self
    }

    /// Add or replace a propagation directive by name.
    #[must_use]
    pub fn with_directive(mut self, directive: PropagationDirective) -> Self {
        self.upsert_directive(directive);
        self
    }

    /// Delegate to a controller repository.
    #[must_use]
    pub fn with_controller(mut self, controller: ControllerRepository) -> Self {
        self.controller_repositories.push(controller);
        self
    }

    /// Accept delegation from a repository.
    #[must_use]
    pub fn with_network_repository(mut self, repository: NetworkRepository) -> Self {
        self.network_repositories.push(repository);
        self
    }

    /// Successor version with the same content.
    #[must_use]
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version.saturating_add(1);
        next
    }

    /// Add or replace a propagation directive by name.
    pub fn upsert_directive(&mut self, directive: PropagationDirective) {
        match self
            .propagation_directives
            .iter_mut()
            .find(|d| d.name == directive.name)
        {
            Some(existing) => *existing = directive,
            None => self.propagation_directives.push(directive),
        }
    }

    /// Directive named `name`.
    #[must_use]
    pub fn directive(&self, name: &str) -> Option<&PropagationDirective> {
        self.propagation_directives.iter().find(|d| d.name == name)
    }
}

impl Metadata for RootMetadata {
    const PAYLOAD_TYPE: &'static str = ROOT_PAYLOAD_TYPE;

    fn validate(&self) -> PolicyResult<()> {
        if self.version == 0 {
            return Err(PolicyError::InvalidMetadata("root version must start at 1".into()));
        }
        check_threshold("root threshold", self.root_threshold, &self.root_keys)?;
        check_threshold("policy threshold", self.policy_threshold, &self.policy_keys)?;

        let mut names = BTreeSet::new();
        for rule in &self.global_rules {
            if !names.insert(rule.name()) {
                return Err(PolicyError::InvalidMetadata(format!(
                    "duplicate global rule '{}'",
                    rule.name()
                )));
            }
            if rule.patterns().is_empty() {
                return Err(PolicyError::InvalidMetadata(format!(
                    "global rule '{}' has no patterns",
                    rule.name()
                )));
            }
            for pattern in rule.patterns() {
                Pattern::parse(pattern)?;
            }
            if let GlobalRule::Threshold { threshold: 0, name, .. } = rule {
                return Err(PolicyError::InvalidMetadata(format!(
                    "global rule '{name}' has a zero threshold"
                )));
            }
        }

        let mut names = BTreeSet::new();
        for directive in &self.propagation_directives {
            if !names.insert(directive.name.as_str()) {
                return Err(PolicyError::InvalidMetadata(format!(
                    "duplicate propagation directive '{}'",
                    directive.name
                )));
            }
        }

        let mut names = BTreeSet::new();
        for controller in &self.controller_repositories {
            if !names.insert(controller.name.as_str()) || controller.name.contains('/') {
                return Err(PolicyError::InvalidMetadata(format!(
                    "invalid or duplicate controller name '{}'",
                    controller.name
                )));
            }
            if controller.initial_root_principals.is_empty() {
                return Err(PolicyError::InvalidMetadata(format!(
                    "controller '{}' has no initial root principals",
                    controller.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rule-set
// ---------------------------------------------------------------------------

/// Someone (or something) that can approve changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    /// A bare key.
    Key {
        /// The key.
        key: PublicKey,
    },
    /// A person holding one or more keys.
    Person {
        /// Person id.
        person_id: String,
        /// Keys the person signs with.
        keys: Vec<PublicKey>,
        /// Identities on external services, keyed by service name.
        #[serde(default)]
        associated_identities: BTreeMap<String, String>,
    },
    /// A team whose members are other principals.
    Team {
        /// Team id.
        team_id: String,
        /// Member principal ids.
        members: BTreeSet<String>,
    },
}

impl Principal {
    /// A key principal.
    #[must_use]
    pub fn key(key: PublicKey) -> Self {
        Self::Key { key }
    }

    /// A person with `keys`.
    #[must_use]
    pub fn person(person_id: impl Into<String>, keys: Vec<PublicKey>) -> Self {
        Self::Person {
            person_id: person_id.into(),
            keys,
            associated_identities: BTreeMap::new(),
        }
    }

    /// A team of `members`.
    #[must_use]
    pub fn team<I, S>(team_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Team {
            team_id: team_id.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Record the person's identity on `service`. No-op for other kinds.
    #[must_use]
    pub fn with_identity(mut self, service: &str, identity: &str) -> Self {
        if let Self::Person {
            associated_identities,
            ..
        } = &mut self
        {
            associated_identities.insert(service.to_string(), identity.to_string());
        }
        self
    }

    /// Keys held directly (teams hold none).
    #[must_use]
    pub fn own_keys(&self) -> &[PublicKey] {
        match self {
            Self::Key { key } => std::slice::from_ref(key),
            Self::Person { keys, .. } => keys,
            Self::Team { .. } => &[],
        }
    }

    /// Whether this is a team.
    #[must_use]
    pub fn is_team(&self) -> bool {
        matches!(self, Self::Team { .. })
    }
}

/// A rule: who must approve changes matching its patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule name.
    pub name: String,
    /// `git:` or `file:` patterns.
    pub patterns: Vec<String>,
    /// Principals whose approval counts.
    pub principal_ids: Vec<String>,
    /// Approvals required.
    pub threshold: usize,
}

impl Rule {
    /// Build a rule.
    #[must_use]
    pub fn new<P, I>(name: impl Into<String>, patterns: P, principal_ids: I, threshold: usize) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            principal_ids: principal_ids.into_iter().map(Into::into).collect(),
            threshold,
        }
    }
}

/// The rule-set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsMetadata {
    /// Version; must grow whenever the content changes.
    pub version: u64,
    /// Principal registry.
    #[serde(default)]
    pub principals: BTreeMap<String, Principal>,
    /// Rules, first match wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl TargetsMetadata {
    /// Empty version-1 rule-set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Self::default()
        }
    }

    /// Register a principal under `id`.
    #[must_use]
    pub fn with_principal(mut self, id: impl Into<String>, principal: Principal) -> Self {
        self.principals.insert(id.into(), principal);
        self
    }

    /// Append a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Whether the rule content (ignoring the version) matches `other`.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.principals == other.principals && self.rules == other.rules
    }
}

impl Metadata for TargetsMetadata {
    const PAYLOAD_TYPE: &'static str = TARGETS_PAYLOAD_TYPE;

    fn validate(&self) -> PolicyResult<()> {
        if self.version == 0 {
            return Err(PolicyError::InvalidMetadata("targets version must start at 1".into()));
        }
        for (id, principal) in &self.principals {
            let embedded = match principal {
                Principal::Person { person_id, .. } => Some(person_id),
                Principal::Team { team_id, members } => {
                    for member in members {
                        match self.principals.get(member) {
                            None => {
                                return Err(PolicyError::InvalidMetadata(format!(
                                    "team '{id}' lists unknown member '{member}'"
                                )));
                            },
                            Some(Principal::Team { .. }) => {
                                return Err(PolicyError::InvalidMetadata(format!(
                                    "team '{id}' cannot contain team '{member}'"
                                )));
                            },
                            Some(_) => {},
                        }
                    }
                    Some(team_id)
                },
                Principal::Key { .. } => None,
            };
            if embedded.is_some_and(|embedded| embedded != id) {
                return Err(PolicyError::InvalidMetadata(format!(
                    "principal registered as '{id}' names itself differently"
                )));
            }
        }

        let mut names = BTreeSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(PolicyError::InvalidMetadata(format!(
                    "duplicate rule '{}'",
                    rule.name
                )));
            }
            if rule.patterns.is_empty() {
                return Err(PolicyError::InvalidMetadata(format!(
                    "rule '{}' has no patterns",
                    rule.name
                )));
            }
            for pattern in &rule.patterns {
                Pattern::parse(pattern)?;
            }
            let distinct: BTreeSet<&str> = rule.principal_ids.iter().map(String::as_str).collect();
            if rule.threshold == 0 || rule.threshold > distinct.len() {
                return Err(PolicyError::InvalidMetadata(format!(
                    "rule '{}' threshold {} is outside 1..={}",
                    rule.name,
                    rule.threshold,
                    distinct.len()
                )));
            }
            // Controller principals (`<controller>/<id>`) resolve at load time.
            if let Some(unknown) = distinct
                .iter()
                .find(|id| !id.contains('/') && !self.principals.contains_key(**id))
            {
                return Err(PolicyError::InvalidMetadata(format!(
                    "rule '{}' names unknown principal '{unknown}'",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}
