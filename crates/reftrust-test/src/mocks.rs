//! Mock implementations for testing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use reftrust_policy::{PolicyError, PolicyResult, RepositoryResolver};
use reftrust_rsl::{EntryId, ReferenceStateLog, RemoteLog, RslEntry, RslResult};
use tokio::sync::watch;

/// A remote log backed by a local one, with hooks to stall reads and lose
/// races.
pub struct MockRemote {
    inner: Arc<ReferenceStateLog>,
    stalled: watch::Sender<bool>,
    reject_next_swap: AtomicBool,
    head_calls: AtomicUsize,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("name", &self.inner.name())
            .field("stalled", &*self.stalled.borrow())
            .finish_non_exhaustive()
    }
}

impl MockRemote {
    /// Serve `inner` as a remote.
    #[must_use]
    pub fn new(inner: Arc<ReferenceStateLog>) -> Self {
        Self {
            inner,
            stalled: watch::Sender::new(false),
            reject_next_swap: AtomicBool::new(false),
            head_calls: AtomicUsize::new(0),
        }
    }

    /// The log being served.
    #[must_use]
    pub fn log(&self) -> &Arc<ReferenceStateLog> {
        &self.inner
    }

    /// Make head reads wait until [`Self::release`].
    pub fn stall(&self) {
        self.stalled.send_replace(true);
    }

    /// Let stalled head reads finish.
    pub fn release(&self) {
        self.stalled.send_replace(false);
    }

    /// Make the next compare-and-swap report that the head moved.
    pub fn reject_next_swap(&self) {
        self.reject_next_swap.store(true, Ordering::SeqCst);
    }

    /// How many times the head was read.
    #[must_use]
    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteLog for MockRemote {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn head(&self) -> RslResult<Option<EntryId>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let mut stalled = self.stalled.subscribe();
        // The sender lives as long as `self`, so this only ends on release.
        let _ = stalled.wait_for(|stalled| !*stalled).await;
        self.inner.head_id().await
    }

    async fn entry(&self, id: &EntryId) -> RslResult<RslEntry> {
        self.inner.get_entry(id).await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<EntryId>,
        entries: Vec<RslEntry>,
    ) -> RslResult<bool> {
        if self.reject_next_swap.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        RemoteLog::compare_and_swap(&*self.inner, expected, entries).await
    }
}

/// Resolves locations from a concurrent map of logs.
#[derive(Clone, Default)]
pub struct MapRepositoryResolver {
    repos: Arc<DashMap<String, Arc<ReferenceStateLog>>>,
}

impl std::fmt::Debug for MapRepositoryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRepositoryResolver")
            .field("repos", &self.repos.len())
            .finish()
    }
}

impl MapRepositoryResolver {
    /// An empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `log` under `location`.
    #[must_use]
    pub fn with(self, location: impl Into<String>, log: Arc<ReferenceStateLog>) -> Self {
        self.insert(location, log);
        self
    }

    /// Register `log` under `location`, replacing any earlier one.
    pub fn insert(&self, location: impl Into<String>, log: Arc<ReferenceStateLog>) {
        self.repos.insert(location.into(), log);
    }

    /// Forget `location`.
    pub fn remove(&self, location: &str) -> bool {
        self.repos.remove(location).is_some()
    }
}

#[async_trait]
impl RepositoryResolver for MapRepositoryResolver {
    async fn resolve(&self, location: &str) -> PolicyResult<Arc<ReferenceStateLog>> {
        self.repos
            .get(location)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PolicyError::RepositoryNotFound(location.to_string()))
    }
}
