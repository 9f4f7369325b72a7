//! Log synchronisation against a remote before and around verification.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{Team, protected_repo};
use reftrust_core::{Classify, ErrorKind, ModeContext};
use reftrust_rsl::{PullOutcome, PushOutcome, RslError};
use reftrust_test::{MockRemote, TestRepo};
use reftrust_verify::VerifyOptions;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_verify_after_pulling_from_remote() -> Result<()> {
    let team = Team::new();
    let origin = protected_repo(ModeContext::strict(), &team, 1).await;
    let entry = origin.record("main", &[("a.txt", b"a")], &team.alice).await;

    let local = TestRepo::new(ModeContext::strict());
    local.fetch_objects(&origin).await;
    let remote = MockRemote::new(Arc::clone(&origin.rsl));

    let verdict = local
        .verifier()
        .verify_ref("main", &VerifyOptions::default().with_remote(&remote))
        .await?;
    assert!(verdict.is_authorized(), "{:?}", verdict.decision.reasons);
    assert_eq!(verdict.entry_id, Some(entry.id));
    assert_eq!(local.rsl.head_id().await?, origin.rsl.head_id().await?);
    assert!(remote.head_calls() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_diverged_logs_are_reported_not_merged() -> Result<()> {
    let team = Team::new();
    let ours = protected_repo(ModeContext::strict(), &team, 1).await;
    let theirs = protected_repo(ModeContext::strict(), &team, 1).await;
    let remote = MockRemote::new(Arc::clone(&theirs.rsl));
    let cancel = CancellationToken::new();
    let head = ours.rsl.head_id().await?;

    let status = ours.rsl.check_remote_for_updates(&remote, &cancel).await?;
    assert!(status.has_updates && status.has_diverged);

    let err = ours.rsl.pull(&remote, &cancel).await.unwrap_err();
    assert!(matches!(err, RslError::Diverged { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ours.rsl.head_id().await?, head);
    Ok(())
}

#[tokio::test]
async fn test_push_reports_lost_race() -> Result<()> {
    let team = Team::new();
    let local = protected_repo(ModeContext::strict(), &team, 1).await;
    let origin = TestRepo::named("origin", ModeContext::strict());
    let remote = MockRemote::new(Arc::clone(&origin.rsl));
    let cancel = CancellationToken::new();

    assert!(matches!(
        local.rsl.push(&remote, &cancel).await?,
        PushOutcome::Pushed(n) if n > 0
    ));
    assert_eq!(local.rsl.pull(&remote, &cancel).await?, PullOutcome::UpToDate);

    local.record("main", &[("a.txt", b"a")], &team.alice).await;
    remote.reject_next_swap();
    let err = local.rsl.push(&remote, &cancel).await.unwrap_err();
    assert!(matches!(err, RslError::UpdateConflict { .. }));

    // No automatic retry: a second explicit push succeeds.
    assert_eq!(local.rsl.push(&remote, &cancel).await?, PushOutcome::Pushed(1));
    assert_eq!(origin.rsl.head_id().await?, local.rsl.head_id().await?);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_sync_leaves_local_state() -> Result<()> {
    let team = Team::new();
    let origin = protected_repo(ModeContext::strict(), &team, 1).await;
    origin.record("main", &[("a.txt", b"a")], &team.alice).await;
    let local = TestRepo::new(ModeContext::strict());
    local.fetch_objects(&origin).await;

    let remote = MockRemote::new(Arc::clone(&origin.rsl));
    remote.stall();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let opts = VerifyOptions::default()
        .with_remote(&remote)
        .with_cancel(cancel);
    let err = local.verifier().verify_ref("main", &opts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(local.rsl.head_id().await?, None);
    Ok(())
}
