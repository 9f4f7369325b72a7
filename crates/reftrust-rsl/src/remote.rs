//! Synchronizing the log with a remote copy.
//!
//! The remote side is anything implementing [`RemoteLog`]. Its only write
//! primitive is a compare-and-swap of the head, which makes `push`
//! linearizable across writers. Every remote call races the caller's
//! [`CancellationToken`]; a cancelled call returns [`RslError::Cancelled`]
//! before anything local is written.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::{EntryId, RslEntry};
use crate::error::{RslError, RslResult};
use crate::log::ReferenceStateLog;

/// A remote copy of a reference state log.
#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Advertised head of the remote chain.
    async fn head(&self) -> RslResult<Option<EntryId>>;

    /// Fetch one entry.
    async fn entry(&self, id: &EntryId) -> RslResult<RslEntry>;

    /// Append `entries` (oldest first) if the head is still `expected`.
    /// Returns `false` without writing if the head moved.
    async fn compare_and_swap(
        &self,
        expected: Option<EntryId>,
        entries: Vec<RslEntry>,
    ) -> RslResult<bool>;
}

#[async_trait]
impl RemoteLog for ReferenceStateLog {
    fn name(&self) -> &str {
        ReferenceStateLog::name(self)
    }

    async fn head(&self) -> RslResult<Option<EntryId>> {
        self.head_id().await
    }

    async fn entry(&self, id: &EntryId) -> RslResult<RslEntry> {
        self.get_entry(id).await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<EntryId>,
        entries: Vec<RslEntry>,
    ) -> RslResult<bool> {
        if self.head_id().await? != expected {
            return Ok(false);
        }
        self.extend(expected, &entries).await
    }
}

/// Result of [`ReferenceStateLog::check_remote_for_updates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStatus {
    /// The remote head differs from the local head. Set in either
    /// direction: a local log ahead of the remote also has updates, the
    /// ones a push would send.
    pub has_updates: bool,
    /// Neither chain is a prefix of the other.
    pub has_diverged: bool,
}

/// Result of [`ReferenceStateLog::pull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing to fetch; local is at or ahead of the remote.
    UpToDate,
    /// Local was fast-forwarded by this many entries.
    FastForwarded(usize),
}

/// Result of [`ReferenceStateLog::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote already had every local entry.
    UpToDate,
    /// Remote was advanced by this many entries.
    Pushed(usize),
}

enum Comparison {
    Same,
    RemoteEmpty,
    LocalAhead,
    RemoteAhead(Vec<RslEntry>),
    Diverged,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = RslResult<T>>,
) -> RslResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RslError::Cancelled),
        result = fut => result,
    }
}

impl ReferenceStateLog {
    async fn compare_with(
        &self,
        remote: &dyn RemoteLog,
        cancel: &CancellationToken,
    ) -> RslResult<Comparison> {
        let remote_head = cancellable(cancel, remote.head()).await?;
        let local_head = self.head().await?;
        let local_id = local_head.as_ref().map(|e| e.id);
        let local_number = local_head.as_ref().map_or(0, |e| e.number);

        let Some(remote_head) = remote_head else {
            return Ok(if local_id.is_none() {
                Comparison::Same
            } else {
                Comparison::RemoteEmpty
            });
        };
        if Some(remote_head) == local_id {
            return Ok(Comparison::Same);
        }
        if self.contains(&remote_head).await? {
            return Ok(Comparison::LocalAhead);
        }

        // Walk the remote chain back until it meets the local head or
        // passes below it.
        let mut missing = Vec::new();
        let mut cursor = Some(remote_head);
        while let Some(id) = cursor {
            if Some(id) == local_id {
                missing.reverse();
                return Ok(Comparison::RemoteAhead(missing));
            }
            let entry = cancellable(cancel, remote.entry(&id)).await?;
            if entry.id != id || !entry.is_intact() {
                return Err(RslError::IntegrityViolation {
                    entry_id: id,
                    reason: format!("remote '{}' sent a mismatched entry", remote.name()),
                });
            }
            if entry.number <= local_number {
                return Ok(Comparison::Diverged);
            }
            cursor = entry.parent_id;
            missing.push(entry);
        }
        Ok(if local_id.is_none() {
            missing.reverse();
            Comparison::RemoteAhead(missing)
        } else {
            Comparison::Diverged
        })
    }

    /// Compare the local head with `remote`'s head without changing
    /// anything.
    ///
    /// A remote with no entries reports no updates. A local log ahead of
    /// the remote reports `has_updates` just like one behind it.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::Cancelled`] if `cancel` fires first, or the
    /// remote's error if it cannot be read.
    pub async fn check_remote_for_updates(
        &self,
        remote: &dyn RemoteLog,
        cancel: &CancellationToken,
    ) -> RslResult<RemoteStatus> {
        let status = match self.compare_with(remote, cancel).await? {
            Comparison::Same | Comparison::RemoteEmpty => RemoteStatus::default(),
            Comparison::LocalAhead | Comparison::RemoteAhead(_) => RemoteStatus {
                has_updates: true,
                has_diverged: false,
            },
            Comparison::Diverged => RemoteStatus {
                has_updates: true,
                has_diverged: true,
            },
        };
        debug!(
            remote = remote.name(),
            has_updates = status.has_updates,
            has_diverged = status.has_diverged,
            "Checked remote for updates"
        );
        Ok(status)
    }

    /// Fast-forward the local chain to `remote`'s head.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::Diverged`] if the chains diverged,
    /// [`RslError::Cancelled`] if `cancel` fires before the local head
    /// moves, and [`RslError::ConcurrentAppend`] if the local head moved
    /// during the pull.
    pub async fn pull(
        &self,
        remote: &dyn RemoteLog,
        cancel: &CancellationToken,
    ) -> RslResult<PullOutcome> {
        match self.compare_with(remote, cancel).await? {
            Comparison::Same | Comparison::RemoteEmpty | Comparison::LocalAhead => {
                Ok(PullOutcome::UpToDate)
            },
            Comparison::Diverged => {
                warn!(remote = remote.name(), "Refusing to pull diverged log");
                Err(RslError::Diverged {
                    remote: remote.name().to_string(),
                })
            },
            Comparison::RemoteAhead(entries) => {
                if cancel.is_cancelled() {
                    return Err(RslError::Cancelled);
                }
                let expected = entries.first().and_then(|e| e.parent_id);
                if !self.extend(expected, &entries).await? {
                    return Err(RslError::ConcurrentAppend);
                }
                info!(
                    remote = remote.name(),
                    fetched = entries.len(),
                    "Fast-forwarded log from remote"
                );
                Ok(PullOutcome::FastForwarded(entries.len()))
            },
        }
    }

    /// Send local entries the remote lacks, updating its head with a
    /// compare-and-swap. Never retries.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::UpdateConflict`] if the remote holds entries the
    /// local chain lacks or its head moved concurrently, and
    /// [`RslError::Cancelled`] if `cancel` fires first.
    pub async fn push(
        &self,
        remote: &dyn RemoteLog,
        cancel: &CancellationToken,
    ) -> RslResult<PushOutcome> {
        let remote_head = cancellable(cancel, remote.head()).await?;
        let local_head = self.head_id().await?;
        if remote_head == local_head {
            return Ok(PushOutcome::UpToDate);
        }
        let conflict = || RslError::UpdateConflict {
            remote: remote.name().to_string(),
        };
        if let Some(remote_head) = &remote_head
            && !self.contains(remote_head).await?
        {
            warn!(remote = remote.name(), "Remote has entries missing locally");
            return Err(conflict());
        }
        let entries = self.load().await?.after(remote_head.as_ref());
        let count = entries.len();
        if !cancellable(cancel, remote.compare_and_swap(remote_head, entries)).await? {
            warn!(remote = remote.name(), "Remote head moved during push");
            return Err(conflict());
        }
        info!(remote = remote.name(), pushed = count, "Pushed log to remote");
        Ok(PushOutcome::Pushed(count))
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
