use std::collections::BTreeMap;

use async_trait::async_trait;
use reftrust_core::{Classify, ErrorKind};
use reftrust_crypto::ContentHash;
use reftrust_rsl::CreateEntryOptions;

use super::*;
use crate::metadata::{NetworkRepository, Principal, Rule};

fn new_store(mode: ModeContext) -> PolicyStore {
    let log = ReferenceStateLog::shared(Repository::in_memory().unwrap(), mode).unwrap();
    PolicyStore::new(log, mode)
}

fn keys(n: usize) -> Vec<KeyPair> {
    (0..n).map(|_| KeyPair::generate()).collect()
}

fn public(keys: &[KeyPair]) -> Vec<PublicKey> {
    keys.iter().map(KeyPair::public_key).collect()
}

fn rule_set(developer: &KeyPair) -> TargetsMetadata {
    TargetsMetadata::new()
        .with_principal("alice", Principal::person("alice", vec![developer.public_key()]))
        .with_rule(Rule::new("main", ["git:main"], ["alice"], 1))
}

async fn apply_genesis(store: &PolicyStore, root_keys: &[KeyPair], threshold: usize) -> RootMetadata {
    let root = RootMetadata::new(public(root_keys), threshold);
    let signers: Vec<&KeyPair> = root_keys.iter().collect();
    store
        .apply(
            &root.seal(&signers).unwrap(),
            &rule_set(&root_keys[0]).seal(&signers).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    root
}

/// Resolver over a fixed set of logs.
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

#[tokio::test]
async fn test_apply_and_load_genesis() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    apply_genesis(&store, &k, 1).await;

    let state = store.load_latest().await.unwrap();
    assert_eq!(state.root.version, 1);
    assert_eq!(state.rule_for_ref("main").unwrap().name, "main");
    let entry = store
        .rsl()
        .get_latest_entry(POLICY_REF, &LatestEntryOptions::default())
        .await
        .unwrap();
    assert_eq!(state.entry_id, Some(entry.id));
    assert_eq!(state.commit, entry.target_id());
}

#[tokio::test]
async fn test_load_without_policy() {
    let store = new_store(ModeContext::strict());
    let err = store.load_latest().await.unwrap_err();
    assert!(matches!(err, PolicyError::NotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_genesis_must_be_self_signed() {
    let store = new_store(ModeContext::strict());
    let k = keys(2);
    let root = RootMetadata::new(public(&k), 2);
    let err = store
        .apply(
            &root.seal(&[&k[0]]).unwrap(),
            &rule_set(&k[0]).seal(&[&k[0], &k[1]]).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_root_update_needs_previous_threshold() {
    let store = new_store(ModeContext::strict());
    let k = keys(3);
    let root = apply_genesis(&store, &k, 2).await;
    let (_, targets) = store.staged_metadata().await.unwrap();
    let targets = targets.seal(&[&k[0], &k[1]]).unwrap();

    // Rotate to a single fresh key.
    let fresh = KeyPair::generate();
    let mut next = root.next_version();
    next.root_keys = vec![fresh.public_key()];
    next.root_threshold = 1;

    let err = store
        .apply(&next.seal(&[&k[0], &fresh]).unwrap(), &targets, ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::Unauthorized(_)));

    store
        .apply(&next.seal(&[&k[0], &k[1]]).unwrap(), &targets, ApplyOptions::default())
        .await
        .unwrap();
    let history = store.root_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].root_keys, vec![fresh.public_key()]);

    // The rotated key alone now governs the root.
    let third = history[1].next_version();
    store
        .apply(&third.seal(&[&fresh]).unwrap(), &targets, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(store.load_latest().await.unwrap().root.version, 3);
}

#[tokio::test]
async fn test_root_version_must_advance_by_one() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let root = apply_genesis(&store, &k, 1).await;
    let (_, targets) = store.staged_metadata().await.unwrap();

    let mut skipped = root.next_version();
    skipped.version = 5;
    let err = store
        .apply(
            &skipped.seal(&[&k[0]]).unwrap(),
            &targets.seal(&[&k[0]]).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::InvalidMetadata(_)));
}

#[tokio::test]
async fn test_rule_set_checks() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let root = apply_genesis(&store, &k, 1).await;
    let root_envelope = root.seal(&[&k[0]]).unwrap();

    let mut changed = rule_set(&k[0]).with_rule(Rule::new("dev", ["git:dev"], ["alice"], 1));
    let err = store
        .apply(&root_envelope, &changed.seal(&[&k[0]]).unwrap(), ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::InvalidMetadata(_)));

    changed.version = 2;
    let outsider = KeyPair::generate();
    let err = store
        .apply(&root_envelope, &changed.seal(&[&outsider]).unwrap(), ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    store
        .apply(&root_envelope, &changed.seal(&[&k[0]]).unwrap(), ApplyOptions::default())
        .await
        .unwrap();
    let state = store.load_latest().await.unwrap();
    assert_eq!(state.targets.rules.len(), 2);
}

#[tokio::test]
async fn test_reapplying_is_a_noop() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let root = RootMetadata::new(public(&k), 1).seal(&[&k[0]]).unwrap();
    let targets = rule_set(&k[0]).seal(&[&k[0]]).unwrap();
    let first = store
        .apply(&root, &targets, ApplyOptions::default())
        .await
        .unwrap();
    let second = store
        .apply(&root, &targets, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.rsl().entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_apply_without_log_entry_is_staged() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let root = apply_genesis(&store, &k, 1).await;
    let (_, targets) = store.staged_metadata().await.unwrap();

    store
        .apply(
            &root.next_version().seal(&[&k[0]]).unwrap(),
            &targets.seal(&[&k[0]]).unwrap(),
            ApplyOptions::default().without_rsl_entry(),
        )
        .await
        .unwrap();
    assert_eq!(store.rsl().entries().await.unwrap().len(), 1);
    assert_eq!(store.load_latest().await.unwrap().root.version, 1);
    let staged = store.load_staged().await.unwrap();
    assert_eq!(staged.root.version, 2);
    assert!(staged.entry_id.is_none());
}

#[tokio::test]
async fn test_load_at_uses_policy_in_force() {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let root = apply_genesis(&store, &k, 1).await;
    let branch_entry = store
        .rsl()
        .create_entry("main", ContentHash::hash(b"c1"), CreateEntryOptions::default())
        .await
        .unwrap();
    let (_, targets) = store.staged_metadata().await.unwrap();
    store
        .apply(
            &root.next_version().seal(&[&k[0]]).unwrap(),
            &targets.seal(&[&k[0]]).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();

    let then = store.load_at(&branch_entry.id).await.unwrap();
    assert_eq!(then.root.version, 1);
    assert_eq!(store.load_latest().await.unwrap().root.version, 2);
}

#[tokio::test]
async fn test_forged_root_breaks_the_chain() {
    let store = new_store(ModeContext::strict());
    let k = keys(2);
    let root = apply_genesis(&store, &k, 2).await;

    // Write a version signed by only one key directly, bypassing apply.
    let mut forged = root.next_version();
    forged.root_threshold = 1;
    let envelope = forged.seal(&[&k[0]]).unwrap();
    let repo = store.rsl().repository();
    let mut tree = repo.tree_at_ref(POLICY_REF).await.unwrap();
    let blob = repo
        .objects()
        .put_blob(serde_json::to_vec(&envelope).unwrap())
        .await
        .unwrap();
    tree.insert(ROOT_PATH, blob);
    store
        .rsl()
        .commit_and_record(POLICY_REF, &tree, "forged", None)
        .await
        .unwrap();

    let err = store.load_latest().await.unwrap_err();
    assert!(matches!(err, PolicyError::RootChainBroken { version: 2, .. }));
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_propagation_directive_updates_need_developer_mode() {
    let directive = PropagationDirective {
        name: "vendor".into(),
        upstream_repository: "https://example.com/lib".into(),
        upstream_reference: "refs/heads/main".into(),
        upstream_path: "lib".into(),
        downstream_reference: "refs/heads/main".into(),
        downstream_path: "vendor/lib".into(),
    };
    let k = keys(1);

    let strict = new_store(ModeContext::strict());
    apply_genesis(&strict, &k, 1).await;
    let err = strict
        .update_propagation_directive(directive.clone(), &[&k[0]], ApplyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModeRestricted);

    let dev = new_store(ModeContext::developer());
    apply_genesis(&dev, &k, 1).await;
    dev.update_propagation_directive(directive, &[&k[0]], ApplyOptions::default())
        .await
        .unwrap();
    let state = dev.load_latest().await.unwrap();
    assert_eq!(state.root.version, 2);
    assert_eq!(state.directive("vendor").unwrap().downstream_path, "vendor/lib");

    dev.remove_propagation_directive("vendor", &[&k[0]], ApplyOptions::default())
        .await
        .unwrap();
    assert!(dev.load_latest().await.unwrap().directives().is_empty());
    let err = dev
        .remove_propagation_directive("vendor", &[&k[0]], ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

const CONTROLLER_LOCATION: &str = "https://example.com/org";
const APP_LOCATION: &str = "https://example.com/app";

async fn controller_store(listed: &str) -> (PolicyStore, Vec<KeyPair>, KeyPair) {
    let store = new_store(ModeContext::strict());
    let k = keys(1);
    let member = KeyPair::generate();
    let root = RootMetadata::new(public(&k), 1).with_network_repository(NetworkRepository {
        name: "app".into(),
        location: listed.into(),
    });
    let targets = TargetsMetadata::new()
        .with_principal("bob", Principal::person("bob", vec![member.public_key()]))
        .with_rule(Rule::new("all", ["git:refs/heads/*"], ["bob"], 1));
    store
        .apply(
            &root.seal(&[&k[0]]).unwrap(),
            &targets.seal(&[&k[0]]).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    (store, k, member)
}

async fn delegating_store(controller: &PolicyStore, initial: Vec<PublicKey>) -> PolicyStore {
    let resolver = FixedResolver(BTreeMap::from([(
        CONTROLLER_LOCATION.to_string(),
        Arc::clone(controller.rsl()),
    )]));
    let store = new_store(ModeContext::strict())
        .with_location(APP_LOCATION)
        .with_resolver(Arc::new(resolver));
    let k = keys(1);
    let root = RootMetadata::new(public(&k), 1).with_controller(ControllerRepository {
        name: "org".into(),
        location: CONTROLLER_LOCATION.into(),
        initial_root_principals: initial,
    });
    let targets = TargetsMetadata::new()
        .with_principal("alice", Principal::person("alice", vec![k[0].public_key()]))
        .with_rule(Rule::new("main", ["git:main"], ["alice", "org/bob"], 2));
    store
        .apply(
            &root.seal(&[&k[0]]).unwrap(),
            &targets.seal(&[&k[0]]).unwrap(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_controller_principals_are_trusted() {
    let (controller, controller_keys, member) = controller_store(APP_LOCATION).await;
    let store = delegating_store(&controller, public(&controller_keys)).await;

    let state = store.load_latest().await.unwrap();
    assert_eq!(state.controllers.len(), 1);
    assert_eq!(state.principal_keys("org/bob"), vec![member.public_key()]);
}

#[tokio::test]
async fn test_controller_genesis_keys_must_match() {
    let (controller, _, _) = controller_store(APP_LOCATION).await;
    let impostor = KeyPair::generate();
    let store = delegating_store(&controller, vec![impostor.public_key()]).await;

    let err = store.load_latest().await.unwrap_err();
    assert!(matches!(err, PolicyError::Controller { .. }));
}

#[tokio::test]
async fn test_controller_must_list_the_repository() {
    let (controller, controller_keys, _) = controller_store("https://example.com/elsewhere").await;
    let store = delegating_store(&controller, public(&controller_keys)).await;

    let err = store.load_latest().await.unwrap_err();
    assert!(matches!(err, PolicyError::Controller { .. }));
}

#[tokio::test]
async fn test_controller_needs_a_resolver() {
    let (controller, controller_keys, _) = controller_store(APP_LOCATION).await;
    let with_resolver = delegating_store(&controller, public(&controller_keys)).await;
    let without = PolicyStore::new(Arc::clone(with_resolver.rsl()), ModeContext::strict())
        .with_location(APP_LOCATION);

    let err = without.load_latest().await.unwrap_err();
    assert!(matches!(err, PolicyError::Controller { .. }));
}
