//! Shared setup for integration tests.

#![allow(dead_code)]

use reftrust_core::ModeContext;
use reftrust_crypto::KeyPair;
use reftrust_policy::{Principal, PropagationDirective, RootMetadata, Rule, TargetsMetadata};
use reftrust_test::TestRepo;

/// Location the upstream repository is resolved under.
pub const UPSTREAM: &str = "https://example.com/upstream";

/// Three developers and a review app.
pub struct Team {
    pub alice: KeyPair,
    pub bob: KeyPair,
    pub carol: KeyPair,
    pub app: KeyPair,
}

impl Team {
    pub fn new() -> Self {
        Self {
            alice: KeyPair::generate(),
            bob: KeyPair::generate(),
            carol: KeyPair::generate(),
            app: KeyPair::generate(),
        }
    }

    /// Root owned by `owner` that trusts the review app.
    pub fn root(&self, owner: &KeyPair) -> RootMetadata {
        RootMetadata::new(vec![owner.public_key()], 1).with_app_key(self.app.public_key())
    }

    /// `main` needs `threshold` of alice, bob, carol and the app.
    pub fn targets(&self, threshold: usize) -> TargetsMetadata {
        TargetsMetadata::new()
            .with_principal("alice", Principal::person("alice", vec![self.alice.public_key()]))
            .with_principal("bob", Principal::person("bob", vec![self.bob.public_key()]))
            .with_principal("carol", Principal::person("carol", vec![self.carol.public_key()]))
            .with_principal("app", Principal::key(self.app.public_key()))
            .with_rule(Rule::new(
                "protect-main",
                ["git:refs/heads/main"],
                ["alice", "bob", "carol", "app"],
                threshold,
            ))
    }
}

/// A repository whose `main` is protected by [`Team::targets`].
pub async fn protected_repo(mode: ModeContext, team: &Team, threshold: usize) -> TestRepo {
    let repo = TestRepo::new(mode);
    repo.apply_policy(&team.root(&repo.owner), &team.targets(threshold))
        .await;
    repo
}

/// Copies `lib` of the upstream `main` into `vendor/lib` of `main`.
pub fn vendor_directive() -> PropagationDirective {
    PropagationDirective {
        name: "vendor-lib".into(),
        upstream_repository: UPSTREAM.into(),
        upstream_reference: "main".into(),
        upstream_path: "lib".into(),
        downstream_reference: "main".into(),
        downstream_path: "vendor/lib".into(),
    }
}
