//! Policy persistence on the policy reference.
//!
//! Each policy version is a commit on [`POLICY_REF`] whose tree holds two
//! signed envelopes:
//!
//! - `metadata/root.json`: the root of trust
//! - `metadata/targets.json`: the rule-set
//!
//! Applying a version normally also appends a log entry for the commit;
//! loading reads the version recorded in the log, verifying the whole chain
//! of root versions back to the genesis root every time.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use reftrust_core::{Mode, ModeContext, POLICY_REF};
use reftrust_crypto::{CryptoError, Envelope, KeyId, KeyPair, PublicKey};
use reftrust_rsl::{EntryId, LatestEntryOptions, ReferenceStateLog, RslEntry, RslError};
use reftrust_storage::{ObjectId, Repository, Tree};
use tracing::{debug, info, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::metadata::{
    ControllerRepository, Metadata, PropagationDirective, RootMetadata, TargetsMetadata,
};
use crate::resolver::RepositoryResolver;
use crate::state::PolicyState;

/// Path of the root envelope in a policy tree.
pub const ROOT_PATH: &str = "metadata/root.json";

/// Path of the rule-set envelope in a policy tree.
pub const TARGETS_PATH: &str = "metadata/targets.json";

/// How deep controller delegation may nest.
const MAX_CONTROLLER_DEPTH: usize = 8;

/// Options for [`PolicyStore::apply`].
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions<'a> {
    /// Append a log entry for the new policy commit.
    pub create_rsl_entry: bool,
    /// Key signing the policy commit and its log entry.
    pub signer: Option<&'a KeyPair>,
}

impl Default for ApplyOptions<'_> {
    fn default() -> Self {
        Self {
            create_rsl_entry: true,
            signer: None,
        }
    }
}

impl<'a> ApplyOptions<'a> {
    /// Move the policy reference without recording it in the log.
    #[must_use]
    pub fn without_rsl_entry(mut self) -> Self {
        self.create_rsl_entry = false;
        self
    }

    /// Sign the commit and entry with `key`.
    #[must_use]
    pub fn signed_by(mut self, key: &'a KeyPair) -> Self {
        self.signer = Some(key);
        self
    }
}

/// Outcome of checking one root version against its predecessor.
enum Succession {
    Valid,
    WrongVersion { expected: u64 },
    NotSigned(CryptoError),
}

fn succession(previous: &RootMetadata, next: &RootMetadata, envelope: &Envelope) -> Succession {
    let expected = previous.version.saturating_add(1);
    if next.version != expected {
        return Succession::WrongVersion { expected };
    }
    match envelope.verify_threshold(&previous.root_keys, previous.root_threshold) {
        Ok(_) => Succession::Valid,
        Err(e) => Succession::NotSigned(e),
    }
}

fn unauthorized(what: &'static str) -> impl FnOnce(CryptoError) -> PolicyError {
    move |e| PolicyError::Unauthorized(format!("{what}: {e}"))
}

fn controller_error(name: &str, reason: impl Into<String>) -> PolicyError {
    PolicyError::Controller {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Reads, verifies and writes policy versions of one repository.
#[derive(Clone)]
pub struct PolicyStore {
    repo: Repository,
    rsl: Arc<ReferenceStateLog>,
    mode: ModeContext,
    location: Option<String>,
    resolver: Option<Arc<dyn RepositoryResolver>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("rsl", &self.rsl.name())
            .field("location", &self.location)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Create a store over the repository behind `rsl`.
    #[must_use]
    pub fn new(rsl: Arc<ReferenceStateLog>, mode: ModeContext) -> Self {
        Self {
            repo: rsl.repository().clone(),
            rsl,
            mode,
            location: None,
            resolver: None,
        }
    }

    /// Location this repository is known by to its controllers.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Resolver used to reach controller repositories.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn RepositoryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The log policy versions are recorded in.
    #[must_use]
    pub fn rsl(&self) -> &Arc<ReferenceStateLog> {
        &self.rsl
    }

    /// The configured location, if any.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// The configured resolver, if any.
    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<dyn RepositoryResolver>> {
        self.resolver.as_ref()
    }

    // -----------------------------------------------------------------------
    // Reading documents
    // -----------------------------------------------------------------------

    async fn read_envelope(&self, tree: &Tree, path: &str) -> PolicyResult<Option<Envelope>> {
        let Some(blob) = tree.entries.get(path) else {
            return Ok(None);
        };
        let bytes = self.repo.objects().get_blob(blob).await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PolicyError::InvalidMetadata(format!("{path}: {e}")))
    }

    async fn read_documents(&self, commit: &ObjectId) -> PolicyResult<(Envelope, Envelope)> {
        let tree = self.repo.tree_at(commit).await?;
        let root = self.read_envelope(&tree, ROOT_PATH).await?;
        let targets = self.read_envelope(&tree, TARGETS_PATH).await?;
        match (root, targets) {
            (Some(root), Some(targets)) => Ok((root, targets)),
            _ => Err(PolicyError::NotFound(format!(
                " in policy commit {}",
                commit.short()
            ))),
        }
    }

    async fn tip_documents(&self) -> PolicyResult<Option<(ObjectId, Envelope, Envelope)>> {
        let Some(tip) = self.repo.ref_tip(POLICY_REF).await? else {
            return Ok(None);
        };
        let (root, targets) = self.read_documents(&tip).await?;
        Ok(Some((tip, root, targets)))
    }

    /// Root and rule-set at the tip of the policy reference, including a
    /// version applied without a log entry.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if no policy was ever applied.
    pub async fn staged_metadata(&self) -> PolicyResult<(RootMetadata, TargetsMetadata)> {
        let (_, root, targets) = self
            .tip_documents()
            .await?
            .ok_or_else(|| PolicyError::NotFound(String::new()))?;
        Ok((RootMetadata::open(&root)?, TargetsMetadata::open(&targets)?))
    }

    // -----------------------------------------------------------------------
    // Applying
    // -----------------------------------------------------------------------

    /// Apply a new policy version.
    ///
    /// The root must be signed by a threshold of the current root's keys
    /// (by its own keys for the first version) and carry the next version
    /// number; the rule-set must be signed by a threshold of the new root's
    /// policy keys. Applying the version already in place is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Unauthorized`] if signatures are missing,
    /// [`PolicyError::InvalidMetadata`] for a malformed document or a
    /// version that does not advance, or a log error if recording fails
    /// (in which case nothing is applied).
    pub async fn apply(
        &self,
        root: &Envelope,
        targets: &Envelope,
        opts: ApplyOptions<'_>,
    ) -> PolicyResult<ObjectId> {
        let new_root = RootMetadata::open(root)?;
        let new_targets = TargetsMetadata::open(targets)?;

        match self.tip_documents().await? {
            None => {
                root.verify_threshold(&new_root.root_keys, new_root.root_threshold)
                    .map_err(unauthorized("genesis root"))?;
            },
            Some((tip, current_root_envelope, current_targets_envelope)) => {
                if *root == current_root_envelope && *targets == current_targets_envelope {
                    debug!(commit = %tip.short(), "Policy already applied");
                    return Ok(tip);
                }
                let current_root = RootMetadata::open(&current_root_envelope)?;
                if new_root != current_root {
                    match succession(&current_root, &new_root, root) {
                        Succession::Valid => {},
                        Succession::WrongVersion { expected } => {
                            return Err(PolicyError::InvalidMetadata(format!(
                                "root version {} does not follow {} (expected {expected})",
                                new_root.version, current_root.version
                            )));
                        },
                        Succession::NotSigned(e) => {
                            warn!(version = new_root.version, error = %e, "Rejected root update");
                            return Err(unauthorized("root update")(e));
                        },
                    }
                }
                let current_targets = TargetsMetadata::open(&current_targets_envelope)?;
                if !new_targets.same_content(&current_targets)
                    && new_targets.version <= current_targets.version
                {
                    return Err(PolicyError::InvalidMetadata(format!(
                        "rule-set changed but version {} does not exceed {}",
                        new_targets.version, current_targets.version
                    )));
                }
            },
        }
        targets
            .verify_threshold(&new_root.policy_keys, new_root.policy_threshold)
            .map_err(unauthorized("rule-set"))?;

        let mut tree = self.repo.tree_at_ref(POLICY_REF).await?;
        for (path, envelope) in [(ROOT_PATH, root), (TARGETS_PATH, targets)] {
            let bytes = serde_json::to_vec(envelope)
                .map_err(|e| PolicyError::InvalidMetadata(e.to_string()))?;
            tree.insert(path, self.repo.objects().put_blob(bytes).await?);
        }

        let commit = if opts.create_rsl_entry {
            let (commit, entry) = self
                .rsl
                .commit_and_record(POLICY_REF, &tree, "Apply policy", opts.signer)
                .await?;
            info!(
                root_version = new_root.version,
                targets_version = new_targets.version,
                entry_id = %entry.id.short(),
                "Applied policy"
            );
            commit
        } else {
            let commit = self
                .repo
                .commit_tree(POLICY_REF, &tree, "Stage policy", opts.signer)
                .await?;
            info!(
                root_version = new_root.version,
                commit = %commit.short(),
                "Staged policy without log entry"
            );
            commit
        };
        Ok(commit)
    }

    /// Add or replace a propagation directive in a new root version signed
    /// by `root_signers`. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Mode`] outside developer mode, or any error
    /// from [`Self::apply`].
    pub async fn update_propagation_directive(
        &self,
        directive: PropagationDirective,
        root_signers: &[&KeyPair],
        opts: ApplyOptions<'_>,
    ) -> PolicyResult<ObjectId> {
        self.mode
            .require(Mode::Developer, "update-propagation-directive")?;
        let (_, root_envelope, targets_envelope) = self
            .tip_documents()
            .await?
            .ok_or_else(|| PolicyError::NotFound(String::new()))?;
        let mut root = RootMetadata::open(&root_envelope)?.next_version();
        info!(directive = %directive.name, version = root.version, "Updating propagation directive");
        root.upsert_directive(directive);
        self.apply(&root.seal(root_signers)?, &targets_envelope, opts)
            .await
    }

    /// Remove the propagation directive `name` in a new root version signed
    /// by `root_signers`. Requires developer mode.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if no such directive exists, or
    /// any error from [`Self::apply`].
    pub async fn remove_propagation_directive(
        &self,
        name: &str,
        root_signers: &[&KeyPair],
        opts: ApplyOptions<'_>,
    ) -> PolicyResult<ObjectId> {
        self.mode
            .require(Mode::Developer, "remove-propagation-directive")?;
        let (_, root_envelope, targets_envelope) = self
            .tip_documents()
            .await?
            .ok_or_else(|| PolicyError::NotFound(String::new()))?;
        let mut root = RootMetadata::open(&root_envelope)?.next_version();
        let before = root.propagation_directives.len();
        root.propagation_directives.retain(|d| d.name != name);
        if root.propagation_directives.len() == before {
            return Err(PolicyError::NotFound(format!(": directive '{name}'")));
        }
        self.apply(&root.seal(root_signers)?, &targets_envelope, opts)
            .await
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    async fn latest_policy_entry(&self) -> PolicyResult<RslEntry> {
        match self
            .rsl
            .get_latest_entry(POLICY_REF, &LatestEntryOptions::unskipped())
            .await
        {
            Ok(entry) => Ok(entry),
            Err(RslError::NotFound(_)) => Err(PolicyError::NotFound(String::new())),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_entry(&self, entry: &RslEntry, depth: usize) -> PolicyResult<PolicyState> {
        let commit = entry.target_id().ok_or_else(|| {
            PolicyError::InvalidMetadata(format!(
                "policy entry {} has no target",
                entry.id.short()
            ))
        })?;
        self.load_commit(commit, Some(entry.id), depth).await
    }

    /// Policy recorded by the latest unskipped policy entry of the log.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if no policy is recorded,
    /// [`PolicyError::RootChainBroken`] if a root version is not vouched
    /// for by its predecessor, and [`PolicyError::Controller`] if a
    /// controller cannot be trusted.
    pub async fn load_latest(&self) -> PolicyResult<PolicyState> {
        let entry = self.latest_policy_entry().await?;
        self.load_entry(&entry, 0).await
    }

    /// Policy in force at `entry_id`: the one recorded by that entry if it
    /// is a policy entry, otherwise by the latest unskipped policy entry
    /// before it.
    ///
    /// # Errors
    ///
    /// As [`Self::load_latest`], plus a log error if `entry_id` is unknown.
    pub async fn load_at(&self, entry_id: &EntryId) -> PolicyResult<PolicyState> {
        let entry = self.rsl.get_entry(entry_id).await?;
        if entry.ref_name() == Some(POLICY_REF) && !self.rsl.is_skipped(entry_id).await? {
            return self.load_entry(&entry, 0).await;
        }
        let policy_entry = match self
            .rsl
            .get_latest_entry(POLICY_REF, &LatestEntryOptions::unskipped().before(*entry_id))
            .await
        {
            Ok(entry) => entry,
            Err(RslError::NotFound(_)) => {
                return Err(PolicyError::NotFound(format!(
                    " before entry {}",
                    entry_id.short()
                )));
            },
            Err(e) => return Err(e.into()),
        };
        self.load_entry(&policy_entry, 0).await
    }

    /// Policy at the tip of the policy reference, recorded or not.
    ///
    /// # Errors
    ///
    /// As [`Self::load_latest`].
    pub async fn load_staged(&self) -> PolicyResult<PolicyState> {
        let tip = self
            .repo
            .ref_tip(POLICY_REF)
            .await?
            .ok_or_else(|| PolicyError::NotFound(String::new()))?;
        self.load_commit(tip, None, 0).await
    }

    /// Verified root versions up to the latest recorded policy, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::RootChainBroken`] on the first version not
    /// vouched for by its predecessor.
    pub async fn root_history(&self) -> PolicyResult<Vec<RootMetadata>> {
        let entry = self.latest_policy_entry().await?;
        let commit = entry
            .target_id()
            .ok_or_else(|| PolicyError::InvalidMetadata("policy entry has no target".into()))?;
        self.root_chain(commit).await
    }

    /// Walk the policy history ending at `commit` and verify every root
    /// version against the one before it.
    async fn root_chain(&self, commit: ObjectId) -> PolicyResult<Vec<RootMetadata>> {
        let objects = self.repo.objects();
        let mut envelopes = Vec::new();
        let mut cursor = Some(commit);
        while let Some(id) = cursor {
            let commit = objects.get_commit(&id).await?;
            let tree = objects.get_tree(&commit.tree).await?;
            if let Some(envelope) = self.read_envelope(&tree, ROOT_PATH).await? {
                envelopes.push(envelope);
            }
            cursor = commit.parents.first().copied();
        }
        envelopes.reverse();

        let mut chain: Vec<RootMetadata> = Vec::new();
        for envelope in envelopes {
            let root = RootMetadata::open(&envelope)?;
            match chain.last() {
                None => {
                    envelope
                        .verify_threshold(&root.root_keys, root.root_threshold)
                        .map_err(|e| PolicyError::RootChainBroken {
                            version: root.version,
                            reason: format!("genesis root is not self-signed: {e}"),
                        })?;
                },
                Some(previous) if *previous == root => continue,
                Some(previous) => match succession(previous, &root, &envelope) {
                    Succession::Valid => {},
                    Succession::WrongVersion { expected } => {
                        return Err(PolicyError::RootChainBroken {
                            version: root.version,
                            reason: format!("expected version {expected}"),
                        });
                    },
                    Succession::NotSigned(e) => {
                        return Err(PolicyError::RootChainBroken {
                            version: root.version,
                            reason: format!("not signed by version {}: {e}", previous.version),
                        });
                    },
                },
            }
            chain.push(root);
        }
        Ok(chain)
    }

    fn load_commit(
        &self,
        commit: ObjectId,
        entry_id: Option<EntryId>,
        depth: usize,
    ) -> BoxFuture<'_, PolicyResult<PolicyState>> {
        async move {
            let chain = self.root_chain(commit).await?;
            let (root_envelope, targets_envelope) = self.read_documents(&commit).await?;
            let root = RootMetadata::open(&root_envelope)?;
            let targets = TargetsMetadata::open(&targets_envelope)?;
            targets_envelope
                .verify_threshold(&root.policy_keys, root.policy_threshold)
                .map_err(unauthorized("rule-set"))?;

            let controllers = root.controller_repositories.clone();
            let mut state = PolicyState::new(root, targets)?.located(entry_id, commit);
            if let Some(genesis) = chain.first() {
                state.genesis_root_keys.clone_from(&genesis.root_keys);
            }
            for controller in controllers {
                let resolved = self.load_controller(&controller, depth).await?;
                state = state.with_controller(controller.name, controller.location, resolved);
            }
            debug!(
                commit = %commit.short(),
                root_version = state.root.version,
                controllers = state.controllers.len(),
                "Loaded policy"
            );
            Ok(state)
        }
        .boxed()
    }

    async fn load_controller(
        &self,
        controller: &ControllerRepository,
        depth: usize,
    ) -> PolicyResult<PolicyState> {
        if depth >= MAX_CONTROLLER_DEPTH {
            return Err(controller_error(&controller.name, "delegation nests too deeply"));
        }
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| controller_error(&controller.name, "no repository resolver"))?;
        let location = self
            .location
            .as_deref()
            .ok_or_else(|| controller_error(&controller.name, "this repository has no location"))?;

        let log = resolver.resolve(&controller.location).await?;
        let store = Self {
            repo: log.repository().clone(),
            rsl: log,
            mode: self.mode,
            location: Some(controller.location.clone()),
            resolver: self.resolver.clone(),
        };
        let entry = store.latest_policy_entry().await?;
        let state = store.load_entry(&entry, depth.saturating_add(1)).await?;

        let expected: BTreeSet<KeyId> = controller
            .initial_root_principals
            .iter()
            .map(PublicKey::key_id)
            .collect();
        let actual: BTreeSet<KeyId> = state
            .genesis_root_keys()
            .iter()
            .map(PublicKey::key_id)
            .collect();
        if expected != actual {
            warn!(controller = %controller.name, "Controller genesis root keys do not match");
            return Err(controller_error(
                &controller.name,
                "genesis root keys differ from the initial root principals",
            ));
        }
        if !state
            .root
            .network_repositories
            .iter()
            .any(|n| n.location == location)
        {
            return Err(controller_error(
                &controller.name,
                format!("does not list {location} as a network repository"),
            ));
        }
        debug!(controller = %controller.name, location = %controller.location, "Trusted controller");
        Ok(state)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
