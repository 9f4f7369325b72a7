//! Test fixtures: keys, repositories and policies.

use std::sync::Arc;

use reftrust_attestations::AttestationStore;
use reftrust_core::{ModeContext, absolute_reference};
use reftrust_crypto::KeyPair;
use reftrust_policy::{
    ApplyOptions, Metadata, PolicyStore, Principal, RootMetadata, Rule, TargetsMetadata,
};
use reftrust_rsl::{CreateEntryOptions, ReferenceStateLog, RslEntry};
use reftrust_storage::{ObjectId, Repository};
use reftrust_verify::Verifier;

/// Generate `n` fresh signing keys.
#[must_use]
pub fn test_keys(n: usize) -> Vec<KeyPair> {
    (0..n).map(|_| KeyPair::generate()).collect()
}

/// A version-1 root trusting `owner` alone.
#[must_use]
pub fn test_root(owner: &KeyPair) -> RootMetadata {
    RootMetadata::new(vec![owner.public_key()], 1)
}

/// A rule-set with one person per `(id, key)` and a rule protecting
/// `main` that needs `threshold` of them.
#[must_use]
pub fn test_rule_set(people: &[(&str, &KeyPair)], threshold: usize) -> TargetsMetadata {
    let mut targets = TargetsMetadata::new();
    for (id, key) in people {
        targets = targets.with_principal(*id, Principal::person(*id, vec![key.public_key()]));
    }
    targets.with_rule(Rule::new(
        "protect-main",
        ["git:main"],
        people.iter().map(|(id, _)| *id),
        threshold,
    ))
}

/// An in-memory repository with its log, owned by a root key.
pub struct TestRepo {
    /// The repository's log.
    pub rsl: Arc<ReferenceStateLog>,
    /// Mode every store of this repository is opened with.
    pub mode: ModeContext,
    /// Root key the policy is signed with.
    pub owner: KeyPair,
}

impl std::fmt::Debug for TestRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRepo")
            .field("rsl", &self.rsl.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl TestRepo {
    /// A fresh repository named "local".
    ///
    /// # Panics
    ///
    /// Panics if the in-memory store cannot be opened.
    #[must_use]
    pub fn new(mode: ModeContext) -> Self {
        Self::named("local", mode)
    }

    /// A fresh repository whose log reports `name`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory store cannot be opened.
    #[must_use]
    pub fn named(name: &str, mode: ModeContext) -> Self {
        let repo = Repository::in_memory().expect("Failed to open in-memory repository");
        let rsl = ReferenceStateLog::open(repo, mode)
            .expect("Failed to open log")
            .named(name);
        Self {
            rsl: Arc::new(rsl),
            mode,
            owner: KeyPair::generate(),
        }
    }

    /// The underlying repository.
    #[must_use]
    pub fn repository(&self) -> &Repository {
        self.rsl.repository()
    }

    /// A policy store over this repository.
    #[must_use]
    pub fn policy(&self) -> PolicyStore {
        PolicyStore::new(Arc::clone(&self.rsl), self.mode)
    }

    /// An attestation store over this repository.
    #[must_use]
    pub fn attestations(&self) -> AttestationStore {
        AttestationStore::new(Arc::clone(&self.rsl), self.mode)
    }

    /// A verifier over this repository.
    #[must_use]
    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.policy(), self.mode)
    }

    /// Seal `root` and `targets` with the owner key and record them.
    ///
    /// # Panics
    ///
    /// Panics if the policy is rejected.
    pub async fn apply_policy(&self, root: &RootMetadata, targets: &TargetsMetadata) {
        self.policy()
            .apply(
                &root.seal(&[&self.owner]).expect("Failed to seal root"),
                &targets.seal(&[&self.owner]).expect("Failed to seal rule-set"),
                ApplyOptions::default(),
            )
            .await
            .expect("Failed to apply policy");
    }

    /// Write `files` on `reference` without recording an entry.
    ///
    /// # Panics
    ///
    /// Panics if the commit cannot be written.
    pub async fn commit(
        &self,
        reference: &str,
        files: &[(&str, &[u8])],
        signer: Option<&KeyPair>,
    ) -> ObjectId {
        self.repository()
            .write_files(&absolute_reference(reference), files, "test change", signer)
            .await
            .expect("Failed to write files")
    }

    /// Write `files` on `reference` and record the new tip, both signed by
    /// `signer`.
    ///
    /// # Panics
    ///
    /// Panics if the commit or the entry cannot be written.
    pub async fn record(
        &self,
        reference: &str,
        files: &[(&str, &[u8])],
        signer: &KeyPair,
    ) -> RslEntry {
        let commit = self.commit(reference, files, Some(signer)).await;
        self.rsl
            .create_entry(reference, commit, CreateEntryOptions::signed_by(signer))
            .await
            .expect("Failed to record entry")
    }

    /// Copy every object of `other` into this repository, as a fetch
    /// would before pulling its log.
    ///
    /// # Panics
    ///
    /// Panics if the objects cannot be copied.
    pub async fn fetch_objects(&self, other: &TestRepo) -> usize {
        self.repository()
            .objects()
            .fetch_from(other.repository().objects())
            .await
            .expect("Failed to fetch objects")
    }
}
