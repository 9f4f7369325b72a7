use std::collections::BTreeMap;

use async_trait::async_trait;
use reftrust_core::{Classify, ErrorKind, POLICY_REF};
use reftrust_crypto::KeyPair;
use reftrust_policy::{
    ApplyOptions, Metadata, PolicyResult, Principal, RepositoryResolver, RootMetadata, Rule,
    TargetsMetadata,
};
use reftrust_rsl::CreateEntryOptions;
use reftrust_storage::Repository;

use super::*;

const UPSTREAM: &str = "https://example.com/lib";

struct FixedResolver(BTreeMap<String, Arc<ReferenceStateLog>>);

#[async_trait]
impl RepositoryResolver for FixedResolver {
    async fn resolve(&self, location: &str) -> PolicyResult<Arc<ReferenceStateLog>> {
        self.0
            .get(location)
            .cloned()
            .ok_or_else(|| PolicyError::RepositoryNotFound(location.to_string()))
    }
}

fn vendor_directive() -> PropagationDirective {
    PropagationDirective {
        name: "vendor-lib".into(),
        upstream_repository: UPSTREAM.into(),
        upstream_reference: "main".into(),
        upstream_path: "lib".into(),
        downstream_reference: "main".into(),
        downstream_path: "vendor/lib".into(),
    }
}

/// A downstream repository vendoring `lib` of an upstream one.
struct Vendored {
    f: Fixture,
    upstream: Arc<ReferenceStateLog>,
    verifier: Verifier,
}

impl Vendored {
    async fn new() -> Self {
        let f = Fixture::build(1, ModeContext::strict(), |root| {
            root.with_directive(vendor_directive())
        })
        .await;
        let upstream =
            ReferenceStateLog::shared(Repository::in_memory().unwrap(), ModeContext::strict())
                .unwrap();
        let resolver = FixedResolver([(UPSTREAM.to_string(), Arc::clone(&upstream))].into());
        let policy = PolicyStore::new(Arc::clone(&f.rsl), ModeContext::strict())
            .with_resolver(Arc::new(resolver));
        Self {
            verifier: Verifier::new(policy, ModeContext::strict()),
            f,
            upstream,
        }
    }

    /// Record `files` on the upstream `main`.
    async fn upstream_change(&self, files: &[(&str, &[u8])]) -> EntryId {
        let commit = self
            .upstream
            .repository()
            .write_files("refs/heads/main", files, "upstream", None)
            .await
            .unwrap();
        self.upstream
            .create_entry("main", commit, CreateEntryOptions::default())
            .await
            .unwrap()
            .id
    }

    /// Write `files` on the downstream `main` and record the commit as a
    /// propagation of `upstream_entry` claiming `digest`.
    async fn propagate(
        &self,
        files: &[(&str, &[u8])],
        upstream_entry: EntryId,
        directive: &str,
        digest: Option<ContentHash>,
    ) -> Verdict {
        let repo = self.f.rsl.repository();
        let commit = repo
            .write_files("refs/heads/main", files, "propagate", None)
            .await
            .unwrap();
        let digest = match digest {
            Some(digest) => digest,
            None => repo.tree_at(&commit).await.unwrap().subtree("vendor/lib").id(),
        };
        self.f
            .rsl
            .create_propagation_entry(
                "main",
                commit,
                UPSTREAM,
                upstream_entry,
                directive,
                digest,
                None,
            )
            .await
            .unwrap();
        self.verifier
            .verify_ref("main", &VerifyOptions::default())
            .await
            .unwrap()
    }
}

struct Fixture {
    rsl: Arc<ReferenceStateLog>,
    verifier: Verifier,
    attestations: AttestationStore,
    alice: KeyPair,
    bob: KeyPair,
    app: KeyPair,
    mallory: KeyPair,
}

impl Fixture {
    async fn new(threshold: usize) -> Self {
        Self::build(threshold, ModeContext::developer(), |root| root).await
    }

    async fn build(
        threshold: usize,
        mode: ModeContext,
        customize: impl FnOnce(RootMetadata) -> RootMetadata,
    ) -> Self {
        let rsl = ReferenceStateLog::shared(Repository::in_memory().unwrap(), mode).unwrap();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let app = KeyPair::generate();

        let root = customize(
            RootMetadata::new(vec![alice.public_key()], 1).with_app_key(app.public_key()),
        );
        let targets = TargetsMetadata::new()
            .with_principal("alice", Principal::person("alice", vec![alice.public_key()]))
            .with_principal("bob", Principal::person("bob", vec![bob.public_key()]))
            .with_principal("app", Principal::key(app.public_key()))
            .with_rule(Rule::new("main", ["git:main"], ["alice", "bob", "app"], threshold));
        let policy = PolicyStore::new(Arc::clone(&rsl), mode);
        policy
            .apply(
                &root.seal(&[&alice]).unwrap(),
                &targets.seal(&[&alice]).unwrap(),
                ApplyOptions::default(),
            )
            .await
            .unwrap();

        Self {
            attestations: AttestationStore::new(Arc::clone(&rsl), mode),
            verifier: Verifier::new(policy, mode),
            rsl,
            alice,
            bob,
            app,
            mallory: KeyPair::generate(),
        }
    }

    async fn record(&self, reference: &str, file: &str, signer: &KeyPair) -> RslEntry {
        let commit = self
            .rsl
            .repository()
            .write_files(reference, &[(file, file.as_bytes())], "change", Some(signer))
            .await
            .unwrap();
        self.rsl
            .create_entry(reference, commit, CreateEntryOptions::signed_by(signer))
            .await
            .unwrap()
    }

    async fn unrecorded(&self, reference: &str, file: &str) -> ObjectId {
        self.rsl
            .repository()
            .write_files(reference, &[(file, file.as_bytes())], "unrecorded", None)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_signed_update_is_authorized() {
    let f = Fixture::new(1).await;
    let entry = f.record("refs/heads/main", "a.txt", &f.alice).await;

    let verdict = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
    assert_eq!(verdict.ref_name, "refs/heads/main");
    assert_eq!(verdict.entry_id, Some(entry.id));
    assert!(verdict.policy_entry_id.is_some());
    assert!(!verdict.prediction);
    assert!(verdict.ensure_authorized().is_ok());
}

#[tokio::test]
async fn test_unknown_signer_is_rejected() {
    let f = Fixture::new(1).await;
    f.record("refs/heads/main", "a.txt", &f.mallory).await;

    let verdict = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(!verdict.is_authorized());
    let err = verdict.ensure_authorized().unwrap_err();
    assert!(matches!(err, VerifyError::Unauthorized { .. }));
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_app_approval_meets_threshold() {
    let f = Fixture::new(2).await;
    let base = f.record("refs/heads/main", "a.txt", &f.alice).await;
    let tip = f.record("refs/heads/main", "b.txt", &f.alice).await;

    let before = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(!before.is_authorized());

    f.attestations
        .record_pull_request_approval(
            "main",
            base.target_id().unwrap(),
            tip.target_id().unwrap(),
            &["bob"],
            &f.app,
        )
        .await
        .unwrap();
    let after = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(after.is_authorized(), "{:?}", after.decision.reasons);
    assert!(after.decision.qualifying().contains("bob"));
    assert!(!after.decision.qualifying().contains("app"));
}

#[tokio::test]
async fn test_reference_authorization_meets_threshold() {
    let f = Fixture::new(2).await;
    let base = f.record("refs/heads/main", "a.txt", &f.alice).await;
    let tip = f.record("refs/heads/main", "b.txt", &f.alice).await;
    assert!(
        !f.verifier
            .verify_ref("main", &VerifyOptions::default())
            .await
            .unwrap()
            .is_authorized()
    );

    f.attestations
        .record_reference_authorization(
            "main",
            base.target_id(),
            tip.target_id().unwrap(),
            &f.bob,
        )
        .await
        .unwrap();
    let verdict = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
    assert_eq!(
        verdict.decision.qualifying(),
        ["alice", "bob"].into_iter().map(String::from).collect()
    );
}

#[tokio::test]
async fn test_history_reports_each_entry() {
    let f = Fixture::new(1).await;
    f.record("refs/heads/main", "a.txt", &f.alice).await;
    f.record("refs/heads/main", "b.txt", &f.mallory).await;

    let verdicts = f
        .verifier
        .verify_ref_history("main", &VerifyOptions::default())
        .await
        .unwrap();
    let authorized: Vec<bool> = verdicts.iter().map(Verdict::is_authorized).collect();
    assert_eq!(authorized, vec![true, false]);
}

#[tokio::test]
async fn test_moved_tip_is_not_recorded() {
    let f = Fixture::new(1).await;
    f.record("refs/heads/main", "a.txt", &f.alice).await;
    f.unrecorded("refs/heads/main", "sneaky.txt").await;

    let err = f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap_err();
    assert!(matches!(err, VerifyError::TipNotRecorded { .. }));
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_unrecorded_reference() {
    let f = Fixture::new(1).await;
    let err = f.verifier.verify_ref("dev", &VerifyOptions::default()).await.unwrap_err();
    assert!(matches!(err, VerifyError::NoEntry(ref r) if r == "refs/heads/dev"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_verify_commit_uses_containing_entry() {
    let f = Fixture::new(1).await;
    let inner = f.unrecorded("refs/heads/main", "a.txt").await;
    let entry = f.record("refs/heads/main", "b.txt", &f.alice).await;

    let verdict = f
        .verifier
        .verify_commit("main", inner, &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(verdict.entry_id, Some(entry.id));
    assert!(verdict.is_authorized());

    let err = f
        .verifier
        .verify_commit("main", ContentHash::hash(b"elsewhere"), &VerifyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::CommitNotRecorded { .. }));
}

#[tokio::test]
async fn test_mergeable_prediction_writes_nothing() {
    let f = Fixture::new(2).await;
    f.record("refs/heads/main", "a.txt", &f.alice).await;
    let signed = f
        .rsl
        .repository()
        .write_files("refs/heads/feature", &[("b.txt", b"b")], "feature", Some(&f.alice))
        .await
        .unwrap();
    let entries_before = f.rsl.entries().await.unwrap().len();

    let verdict = f
        .verifier
        .verify_mergeable("main", "feature", true, &VerifyOptions::default())
        .await
        .unwrap();
    assert!(verdict.prediction);
    assert_eq!(verdict.entry_id, None);
    assert_eq!(verdict.target_id, signed);
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
    assert!(verdict.decision.needs_authorized_merger);
    assert_eq!(f.rsl.entries().await.unwrap().len(), entries_before);

    let err = f
        .verifier
        .verify_mergeable("main", "feature", false, &VerifyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::NoEntry(_)));

    let err = f
        .verifier
        .verify_mergeable("main", "missing", true, &VerifyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::NoTip(_)));
}

#[tokio::test]
async fn test_propagation_entry_is_checked_against_directive() {
    let v = Vendored::new().await;
    let first = v.upstream_change(&[("lib/a.rs", b"a")]).await;

    let verdict = v.propagate(&[("vendor/lib/a.rs", b"a")], first, "vendor-lib", None).await;
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
    assert_eq!(verdict.propagated_by.as_deref(), Some("vendor-lib"));

    // Downstream content no longer matches what the entry claims.
    let claimed = v
        .upstream
        .repository()
        .tree_at(&v.upstream.get_entry(&first).await.unwrap().target_id().unwrap())
        .await
        .unwrap()
        .subtree("lib")
        .id();
    let verdict = v
        .propagate(&[("vendor/lib/b.rs", b"b")], first, "vendor-lib", Some(claimed))
        .await;
    assert!(!verdict.is_authorized());
    assert!(verdict.decision.reasons.iter().any(|r| r.contains("vendor/lib")));

    let verdict = v.propagate(&[("vendor/lib/c.rs", b"c")], first, "unknown", None).await;
    assert!(!verdict.is_authorized());
    assert!(verdict.decision.reasons[0].contains("not in the policy"));
}

#[tokio::test]
async fn test_propagation_entry_cannot_touch_other_paths() {
    let v = Vendored::new().await;
    v.f.record("refs/heads/main", "src/lib.rs", &v.f.alice).await;
    let upstream = v.upstream_change(&[("lib/a.rs", b"a")]).await;
    let verdict = v.propagate(&[("vendor/lib/a.rs", b"a")], upstream, "vendor-lib", None).await;
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);

    // Vendored subtree untouched, but an unsigned change lands elsewhere.
    let verdict = v
        .propagate(&[("src/evil.rs", b"evil")], upstream, "vendor-lib", None)
        .await;
    assert!(!verdict.is_authorized());
    assert!(
        verdict
            .decision
            .reasons
            .iter()
            .any(|r| r.contains("outside vendor/lib") && r.contains("src/evil.rs")),
        "{:?}",
        verdict.decision.reasons
    );
}

#[tokio::test]
async fn test_propagation_entry_needs_recorded_upstream_state() {
    let v = Vendored::new().await;
    let recorded = v.upstream_change(&[("lib/a.rs", b"a")]).await;

    let verdict = v
        .propagate(&[("vendor/lib/a.rs", b"a")], ContentHash::hash(b"bogus"), "vendor-lib", None)
        .await;
    assert!(!verdict.is_authorized());
    assert!(verdict.decision.reasons.iter().any(|r| r.contains("does not exist")));

    // An upstream entry whose content differs from the claimed digest.
    let verdict = v
        .propagate(
            &[("vendor/lib/a.rs", b"a"), ("vendor/lib/b.rs", b"b")],
            recorded,
            "vendor-lib",
            None,
        )
        .await;
    assert!(!verdict.is_authorized());
    assert!(
        verdict
            .decision
            .reasons
            .iter()
            .any(|r| r.contains("upstream content under lib"))
    );

    // Once the upstream records the same content the claim is backed.
    let caught_up = v
        .upstream_change(&[("lib/a.rs", b"a"), ("lib/b.rs", b"b")])
        .await;
    let verdict = v
        .propagate(&[("vendor/lib/b.rs", b"b")], caught_up, "vendor-lib", None)
        .await;
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
}

#[tokio::test]
async fn test_propagation_entry_without_resolver_is_rejected() {
    let v = Vendored::new().await;
    let upstream = v.upstream_change(&[("lib/a.rs", b"a")]).await;
    v.propagate(&[("vendor/lib/a.rs", b"a")], upstream, "vendor-lib", None).await;

    let verdict = v.f.verifier.verify_ref("main", &VerifyOptions::default()).await.unwrap();
    assert!(!verdict.is_authorized());
    assert!(
        verdict
            .decision
            .reasons
            .iter()
            .any(|r| r.contains("repository resolver"))
    );
}

#[tokio::test]
async fn test_verify_from_entry_needs_developer_mode() {
    let strict = Fixture::build(1, ModeContext::strict(), |root| root).await;
    let entry = strict.record("refs/heads/main", "a.txt", &strict.alice).await;
    let err = strict
        .verifier
        .verify_ref_from_entry("main", &entry.id, &VerifyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Mode(_)));
    assert_eq!(err.kind(), ErrorKind::ModeRestricted);
}

#[tokio::test]
async fn test_verify_from_entry_ignores_earlier_history() {
    let f = Fixture::new(1).await;
    f.record("refs/heads/main", "a.txt", &f.mallory).await;
    let good = f.record("refs/heads/main", "b.txt", &f.alice).await;

    let verdicts = f
        .verifier
        .verify_ref_from_entry("main", &good.id, &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].is_authorized());

    let policy_entry = f
        .rsl
        .get_latest_entry(POLICY_REF, &LatestEntryOptions::unskipped())
        .await
        .unwrap();
    let err = f
        .verifier
        .verify_ref_from_entry("main", &policy_entry.id, &VerifyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::EntryMismatch { .. }));
}

#[tokio::test]
async fn test_remote_sync_runs_first() {
    let f = Fixture::new(1).await;
    f.record("refs/heads/main", "a.txt", &f.alice).await;
    let remote =
        ReferenceStateLog::open(Repository::in_memory().unwrap(), ModeContext::strict()).unwrap();

    let opts = VerifyOptions::default().with_remote(&remote);
    assert!(f.verifier.verify_ref("main", &opts).await.unwrap().is_authorized());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = VerifyOptions::default().with_remote(&remote).with_cancel(cancel);
    let err = f.verifier.verify_ref("main", &opts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
