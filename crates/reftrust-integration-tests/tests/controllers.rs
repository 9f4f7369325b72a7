//! Verification in a repository that delegates trust to a controller.

use std::sync::Arc;

use anyhow::Result;
use reftrust_core::{Classify, ErrorKind, ModeContext};
use reftrust_crypto::KeyPair;
use reftrust_policy::{
    ControllerRepository, NetworkRepository, Principal, RootMetadata, Rule, TargetsMetadata,
};
use reftrust_rsl::CreateEntryOptions;
use reftrust_test::{MapRepositoryResolver, TestRepo};
use reftrust_verify::{Verifier, VerifyOptions};

const ORG: &str = "https://example.com/org";
const APP: &str = "https://example.com/app";

struct Network {
    org: TestRepo,
    app: TestRepo,
    resolver: MapRepositoryResolver,
    alice: KeyPair,
    bob: KeyPair,
}

impl Network {
    async fn new(listed: &str, initial_root: Option<KeyPair>) -> Self {
        let org = TestRepo::named("org", ModeContext::strict());
        let app = TestRepo::named("app", ModeContext::strict());
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        org.apply_policy(
            &RootMetadata::new(vec![org.owner.public_key()], 1).with_network_repository(
                NetworkRepository {
                    name: "app".into(),
                    location: listed.into(),
                },
            ),
            &TargetsMetadata::new()
                .with_principal("bob", Principal::person("bob", vec![bob.public_key()]))
                .with_rule(Rule::new("branches", ["git:refs/heads/*"], ["bob"], 1)),
        )
        .await;

        let initial = initial_root.map_or_else(|| org.owner.public_key(), |k| k.public_key());
        app.apply_policy(
            &RootMetadata::new(vec![app.owner.public_key()], 1).with_controller(
                ControllerRepository {
                    name: "org".into(),
                    location: ORG.into(),
                    initial_root_principals: vec![initial],
                },
            ),
            &TargetsMetadata::new()
                .with_principal("alice", Principal::person("alice", vec![alice.public_key()]))
                .with_rule(Rule::new("main", ["git:main"], ["alice", "org/bob"], 2)),
        )
        .await;

        let resolver = MapRepositoryResolver::new().with(ORG, Arc::clone(&org.rsl));
        Self {
            org,
            app,
            resolver,
            alice,
            bob,
        }
    }

    fn verifier(&self) -> Verifier {
        let policy = self
            .app
            .policy()
            .with_location(APP)
            .with_resolver(Arc::new(self.resolver.clone()));
        Verifier::new(policy, ModeContext::strict())
    }

    /// Alice commits, bob records the entry.
    async fn push_main(&self) {
        let commit = self
            .app
            .commit("main", &[("src/lib.rs", b"pub fn f() {}")], Some(&self.alice))
            .await;
        self.app
            .rsl
            .create_entry("main", commit, CreateEntryOptions::signed_by(&self.bob))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_controller_member_counts_toward_threshold() -> Result<()> {
    let net = Network::new(APP, None).await;
    net.push_main().await;

    let verdict = net
        .verifier()
        .verify_ref("main", &VerifyOptions::default())
        .await?
        .ensure_authorized()?;
    assert!(verdict.decision.qualifying().contains("org/bob"));
    assert_eq!(net.org.rsl.name(), "org");
    Ok(())
}

#[tokio::test]
async fn test_unlisted_repository_is_not_controlled() {
    let net = Network::new("https://example.com/elsewhere", None).await;
    net.push_main().await;

    let err = net
        .verifier()
        .verify_ref("main", &VerifyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_controller_root_must_match_pinned_keys() {
    let net = Network::new(APP, Some(KeyPair::generate())).await;
    net.push_main().await;

    let err = net
        .verifier()
        .verify_ref("main", &VerifyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_missing_controller_is_reported() {
    let net = Network::new(APP, None).await;
    net.push_main().await;
    net.resolver.remove(ORG);

    let err = net
        .verifier()
        .verify_ref("main", &VerifyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
