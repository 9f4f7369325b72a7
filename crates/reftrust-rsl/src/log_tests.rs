use super::*;
use reftrust_core::Classify;
use reftrust_core::ErrorKind;

fn open(mode: ModeContext) -> (Repository, ReferenceStateLog) {
    let repo = Repository::in_memory().unwrap();
    let log = ReferenceStateLog::open(repo.clone(), mode).unwrap();
    (repo, log)
}

fn target(label: &str) -> ObjectId {
    ContentHash::hash(label.as_bytes())
}

#[tokio::test]
async fn test_entries_form_a_linear_chain() {
    let (_, log) = open(ModeContext::strict());
    let a = log
        .create_entry("main", target("a"), CreateEntryOptions::default())
        .await
        .unwrap();
    let b = log
        .create_entry("refs/heads/feature", target("b"), CreateEntryOptions::default())
        .await
        .unwrap();
    let c = log
        .create_entry("main", target("c"), CreateEntryOptions::default())
        .await
        .unwrap();

    assert_eq!(a.number, 1);
    assert!(a.parent_id.is_none());
    assert_eq!(b.parent_id, Some(a.id));
    assert_eq!(c.parent_id, Some(b.id));
    assert_eq!(c.number, 3);
    assert_eq!(log.head_id().await.unwrap(), Some(c.id));
}

#[tokio::test]
async fn test_duplicate_entry_is_suppressed() {
    let (_, log) = open(ModeContext::strict());
    let first = log
        .create_entry("main", target("abc123"), CreateEntryOptions::default())
        .await
        .unwrap();
    let second = log
        .create_entry("main", target("abc123"), CreateEntryOptions::default())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(log.entries().await.unwrap().len(), 1);

    let forced = log
        .create_entry(
            "main",
            target("abc123"),
            CreateEntryOptions::default().allow_duplicate(),
        )
        .await
        .unwrap();
    assert_ne!(forced.id, first.id);
    assert_eq!(log.entries().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_check_ignores_skipped_entries() {
    let (_, log) = open(ModeContext::strict());
    let bad = log
        .create_entry("main", target("t"), CreateEntryOptions::default())
        .await
        .unwrap();
    log.create_annotation(&[bad.id], true, "revoked", None)
        .await
        .unwrap();

    let fresh = log
        .create_entry("main", target("t"), CreateEntryOptions::default())
        .await
        .unwrap();
    assert_ne!(fresh.id, bad.id);
}

#[tokio::test]
async fn test_get_latest_entry_filters() {
    let (_, log) = open(ModeContext::strict());
    let one = log
        .create_entry("main", target("1"), CreateEntryOptions::default())
        .await
        .unwrap();
    let two = log
        .create_entry("main", target("2"), CreateEntryOptions::default())
        .await
        .unwrap();

    let latest = log
        .get_latest_entry("main", &LatestEntryOptions::default())
        .await
        .unwrap();
    assert_eq!(latest.id, two.id);

    let before = log
        .get_latest_entry("main", &LatestEntryOptions::default().before(two.id))
        .await
        .unwrap();
    assert_eq!(before.id, one.id);

    log.create_annotation(&[two.id], true, "skip", None)
        .await
        .unwrap();
    let unskipped = log
        .get_latest_entry("main", &LatestEntryOptions::unskipped())
        .await
        .unwrap();
    assert_eq!(unskipped.id, one.id);

    let missing = log
        .get_latest_entry("refs/heads/other", &LatestEntryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_propagation_filter() {
    let (_, log) = open(ModeContext::strict());
    log.create_entry("main", target("local"), CreateEntryOptions::default())
        .await
        .unwrap();
    let propagated = log
        .create_propagation_entry(
            "main",
            target("merged"),
            "https://example.com/upstream",
            target("upstream-entry"),
            "vendor-lib",
            target("digest"),
            None,
        )
        .await
        .unwrap();
    log.create_entry("main", target("later"), CreateEntryOptions::default())
        .await
        .unwrap();

    let found = log
        .get_latest_entry(
            "main",
            &LatestEntryOptions::default().propagation_from("https://example.com/upstream"),
        )
        .await
        .unwrap();
    assert_eq!(found.id, propagated.id);
    assert!(found.is_propagation());

    assert!(
        log.get_latest_entry(
            "main",
            &LatestEntryOptions::default().propagation_from("https://example.com/other"),
        )
        .await
        .is_err()
    );
}

#[tokio::test]
async fn test_annotation_requires_known_entries() {
    let (_, log) = open(ModeContext::strict());
    let entry = log
        .create_entry("main", target("a"), CreateEntryOptions::default())
        .await
        .unwrap();

    let unknown = target("nope");
    let err = log
        .create_annotation(&[entry.id, unknown], false, "msg", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RslError::InvalidReference(id) if id == unknown));
    assert_eq!(log.entries().await.unwrap().len(), 1);

    let err = log.create_annotation(&[], false, "msg", None).await.unwrap_err();
    assert!(matches!(err, RslError::InvalidInput(_)));

    let note = log
        .create_annotation(&[entry.id], false, "looks good", None)
        .await
        .unwrap();
    let notes = log.annotations_for(&entry.id).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].id, note.id);
    assert!(!log.is_skipped(&entry.id).await.unwrap());
}

#[tokio::test]
async fn test_signed_entries() {
    let (_, log) = open(ModeContext::strict());
    let key = KeyPair::generate();
    let entry = log
        .create_entry("main", target("a"), CreateEntryOptions::signed_by(&key))
        .await
        .unwrap();
    let stored = log.get_entry(&entry.id).await.unwrap();
    assert!(stored.valid_signers(&[key.public_key()]).contains(&key.key_id()));
}

#[tokio::test]
async fn test_reopen_reads_persisted_chain() {
    let (repo, log) = open(ModeContext::strict());
    log.create_entry("main", target("a"), CreateEntryOptions::default())
        .await
        .unwrap();
    let b = log
        .create_entry("main", target("b"), CreateEntryOptions::default())
        .await
        .unwrap();

    let reopened = ReferenceStateLog::open(repo, ModeContext::strict()).unwrap();
    assert_eq!(reopened.head_id().await.unwrap(), Some(b.id));
    assert_eq!(reopened.entries_for("main").await.unwrap().len(), 2);
    let parent = reopened.get_parent(&b).await.unwrap().unwrap();
    assert_eq!(parent.number, 1);
}

#[tokio::test]
async fn test_index_follows_writes_from_another_handle() {
    let (repo, log) = open(ModeContext::strict());
    log.create_entry("main", target("a"), CreateEntryOptions::default())
        .await
        .unwrap();
    // Warm the index.
    assert_eq!(log.entries().await.unwrap().len(), 1);

    let other = ReferenceStateLog::open(repo, ModeContext::strict()).unwrap();
    let b = other
        .create_entry("main", target("b"), CreateEntryOptions::default())
        .await
        .unwrap();

    assert_eq!(log.head_id().await.unwrap(), Some(b.id));
    assert_eq!(log.entries().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejects_log_ref_itself() {
    let (_, log) = open(ModeContext::strict());
    let err = log
        .create_entry(RSL_REF, target("a"), CreateEntryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RslError::InvalidInput(_)));
}

#[tokio::test]
async fn test_record_entry_at_commit_requires_eval_mode() {
    let (repo, log) = open(ModeContext::strict());
    let commit = repo
        .write_files("refs/heads/main", &[("f", b"1")], "c1", None)
        .await
        .unwrap();
    let err = log
        .record_entry_at_commit("main", commit, CreateEntryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModeRestricted);
}

#[tokio::test]
async fn test_record_entry_at_commit() {
    let (repo, log) = open(ModeContext::eval());
    let old = repo
        .write_files("refs/heads/main", &[("f", b"1")], "c1", None)
        .await
        .unwrap();
    repo.write_files("refs/heads/main", &[("f", b"2")], "c2", None)
        .await
        .unwrap();
    let stray = repo
        .write_files("refs/heads/side", &[("g", b"x")], "side", None)
        .await
        .unwrap();

    let entry = log
        .record_entry_at_commit("main", old, CreateEntryOptions::default())
        .await
        .unwrap();
    assert_eq!(entry.target_id(), Some(old));

    let err = log
        .record_entry_at_commit("main", stray, CreateEntryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RslError::CommitNotInRef { .. }));
}

#[tokio::test]
async fn test_verify_chain_clean() {
    let (_, log) = open(ModeContext::strict());
    for label in ["a", "b", "c"] {
        log.create_entry("main", target(label), CreateEntryOptions::default())
            .await
            .unwrap();
    }
    let result = log.verify_chain().await.unwrap();
    assert!(result.valid);
    assert_eq!(result.entries_verified, 3);
}

#[tokio::test]
async fn test_verify_chain_detects_tampering() {
    let (repo, log) = open(ModeContext::strict());
    let a = log
        .create_entry("main", target("a"), CreateEntryOptions::default())
        .await
        .unwrap();
    log.create_entry("main", target("b"), CreateEntryOptions::default())
        .await
        .unwrap();

    // Rewrite the first entry in place.
    let mut forged = a.clone();
    forged.body = EntryBody::Reference {
        ref_name: "refs/heads/main".into(),
        target_id: target("evil"),
    };
    let raw = ScopedKvStore::new(repo.kv(), NS_ENTRIES).unwrap();
    raw.set_json(&a.id.to_hex(), &forged).await.unwrap();

    let result = log.verify_chain().await.unwrap();
    assert!(!result.valid);
    assert!(result
        .issues
        .contains(&ChainIssue::TamperedEntry { entry_id: a.id }));

    // A fresh handle refuses to load the tampered chain.
    let fresh = ReferenceStateLog::open(repo, ModeContext::strict()).unwrap();
    let err = fresh.entries().await.unwrap_err();
    assert!(matches!(err, RslError::IntegrityViolation { .. }));
}

#[tokio::test]
async fn test_commit_and_record() {
    let (repo, log) = open(ModeContext::strict());
    let mut tree = Tree::new();
    tree.insert("metadata/root.json", target("root"));

    let (commit, entry) = log
        .commit_and_record("refs/gittuf/policy", &tree, "apply policy", None)
        .await
        .unwrap();
    assert_eq!(repo.ref_tip("refs/gittuf/policy").await.unwrap(), Some(commit));
    assert_eq!(entry.target_id(), Some(commit));
    assert_eq!(entry.ref_name(), Some("refs/gittuf/policy"));

    let (second, _) = log
        .commit_and_record("refs/gittuf/policy", &tree, "again", None)
        .await
        .unwrap();
    assert!(repo.is_ancestor(&commit, &second).await.unwrap());
    assert_eq!(log.entries_for("refs/gittuf/policy").await.unwrap().len(), 2);
}
