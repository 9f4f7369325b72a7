//! The reference state log: main interface for recording and querying
//! trusted reference updates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use reftrust_core::{Mode, ModeContext, RSL_REF, absolute_reference};
use reftrust_crypto::{ContentHash, KeyPair};
use reftrust_storage::{ObjectId, Repository, ScopedKvStore, StorageError, Tree};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::entry::{EntryBody, EntryId, RslEntry};
use crate::error::{RslError, RslResult};

const NS_ENTRIES: &str = "rsl:entries";

/// Filters for [`ReferenceStateLog::get_latest_entry`].
#[derive(Debug, Clone, Default)]
pub struct LatestEntryOptions {
    /// Ignore entries a skip annotation refers to.
    pub unskipped: bool,
    /// Only consider entries strictly older than this one.
    pub before: Option<EntryId>,
    /// Only consider propagation entries from this upstream repository.
    pub propagation_from: Option<String>,
}

impl LatestEntryOptions {
    /// Ignore skipped entries.
    #[must_use]
    pub fn unskipped() -> Self {
        Self {
            unskipped: true,
            ..Self::default()
        }
    }

    /// Only consider entries strictly older than `entry`.
    #[must_use]
    pub fn before(mut self, entry: EntryId) -> Self {
        self.before = Some(entry);
        self
    }

    /// Only consider propagation entries from `repository`.
    #[must_use]
    pub fn propagation_from(mut self, repository: impl Into<String>) -> Self {
        self.propagation_from = Some(repository.into());
        self
    }
}

/// Options for [`ReferenceStateLog::create_entry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateEntryOptions<'a> {
    /// Append even if the latest unskipped entry already records the target.
    pub skip_check_for_duplicate: bool,
    /// Key that signs the new entry.
    pub signer: Option<&'a KeyPair>,
}

impl<'a> CreateEntryOptions<'a> {
    /// Sign the new entry with `key`.
    #[must_use]
    pub fn signed_by(key: &'a KeyPair) -> Self {
        Self {
            skip_check_for_duplicate: false,
            signer: Some(key),
        }
    }

    /// Append even if the target is already recorded.
    #[must_use]
    pub fn allow_duplicate(mut self) -> Self {
        self.skip_check_for_duplicate = true;
        self
    }
}

/// In-memory view of the chain: an arena in chain order plus indexes.
#[derive(Debug, Default)]
pub(crate) struct ChainIndex {
    head: Option<EntryId>,
    chain: Vec<RslEntry>,
    by_id: HashMap<EntryId, usize>,
    by_ref: HashMap<String, Vec<usize>>,
    annotations: HashMap<EntryId, Vec<usize>>,
    skipped: HashSet<EntryId>,
}

impl ChainIndex {
    fn push(&mut self, entry: RslEntry) {
        let pos = self.chain.len();
        match &entry.body {
            EntryBody::Reference { ref_name, .. } | EntryBody::Propagation { ref_name, .. } => {
                self.by_ref.entry(ref_name.clone()).or_default().push(pos);
            },
            EntryBody::Annotation {
                referenced_entry_ids,
                skip,
                ..
            } => {
                for id in referenced_entry_ids {
                    self.annotations.entry(*id).or_default().push(pos);
                    if *skip {
                        self.skipped.insert(*id);
                    }
                }
            },
        }
        self.by_id.insert(entry.id, pos);
        self.head = Some(entry.id);
        self.chain.push(entry);
    }

    pub(crate) fn head(&self) -> Option<&RslEntry> {
        self.chain.last()
    }

    pub(crate) fn contains(&self, id: &EntryId) -> bool {
        self.by_id.contains_key(id)
    }

    pub(crate) fn get(&self, id: &EntryId) -> Option<&RslEntry> {
        self.by_id.get(id).and_then(|pos| self.chain.get(*pos))
    }

    pub(crate) fn after(&self, id: Option<&EntryId>) -> Vec<RslEntry> {
        let start = match id {
            Some(id) => match self.by_id.get(id) {
                Some(pos) => pos.saturating_add(1),
                None => return Vec::new(),
            },
            None => 0,
        };
        self.chain.get(start..).map(<[RslEntry]>::to_vec).unwrap_or_default()
    }

    fn latest(&self, ref_name: &str, opts: &LatestEntryOptions) -> RslResult<Option<&RslEntry>> {
        let limit = match &opts.before {
            Some(id) => *self
                .by_id
                .get(id)
                .ok_or(RslError::EntryNotFound(*id))?,
            None => self.chain.len(),
        };
        let Some(positions) = self.by_ref.get(ref_name) else {
            return Ok(None);
        };
        Ok(positions
            .iter()
            .rev()
            .filter(|pos| **pos < limit)
            .filter_map(|pos| self.chain.get(*pos))
            .filter(|entry| !opts.unskipped || !self.skipped.contains(&entry.id))
            .find(|entry| match &opts.propagation_from {
                Some(repo) => matches!(
                    &entry.body,
                    EntryBody::Propagation { upstream_repository, .. } if upstream_repository == repo
                ),
                None => true,
            }))
    }
}

/// Result of [`ReferenceStateLog::verify_chain`].
#[derive(Debug, Clone)]
pub struct ChainVerificationResult {
    /// Whether the chain is valid.
    pub valid: bool,
    /// Number of entries verified.
    pub entries_verified: usize,
    /// Issues found (empty if valid).
    pub issues: Vec<ChainIssue>,
}

/// An issue found during chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIssue {
    /// The first entry has a parent or is not numbered 1.
    InvalidGenesis {
        /// The entry with invalid genesis.
        entry_id: EntryId,
    },
    /// Entry contents do not hash to its id.
    TamperedEntry {
        /// The tampered entry.
        entry_id: EntryId,
    },
    /// Entry number is not its parent's number plus one.
    BadNumbering {
        /// The misnumbered entry.
        entry_id: EntryId,
        /// Expected number.
        expected: u64,
        /// Actual number.
        actual: u64,
    },
    /// A parent id names an entry that is not stored.
    MissingParent {
        /// The entry with the dangling parent.
        entry_id: EntryId,
        /// The missing parent.
        parent_id: EntryId,
    },
}

impl std::fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidGenesis { entry_id } => write!(f, "Invalid genesis at {entry_id}"),
            Self::TamperedEntry { entry_id } => write!(f, "Tampered entry {entry_id}"),
            Self::BadNumbering {
                entry_id,
                expected,
                actual,
            } => write!(f, "Entry {entry_id} numbered {actual}, expected {expected}"),
            Self::MissingParent {
                entry_id,
                parent_id,
            } => write!(f, "Entry {entry_id} has missing parent {parent_id}"),
        }
    }
}

/// The reference state log of one repository.
///
/// Entries are persisted in the repository's key-value store keyed by id;
/// the current head is the target of [`RSL_REF`]. An in-memory index is
/// refreshed from the head whenever it moves.
pub struct ReferenceStateLog {
    name: String,
    repo: Repository,
    entries: ScopedKvStore,
    index: RwLock<ChainIndex>,
    append_lock: Mutex<()>,
    mode: ModeContext,
}

impl std::fmt::Debug for ReferenceStateLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStateLog")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ReferenceStateLog {
    /// Open the log stored in `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry namespace is rejected by the store.
    pub fn open(repo: Repository, mode: ModeContext) -> RslResult<Self> {
        let entries = ScopedKvStore::new(repo.kv(), NS_ENTRIES)?;
        Ok(Self {
            name: "local".to_string(),
            repo,
            entries,
            index: RwLock::new(ChainIndex::default()),
            append_lock: Mutex::new(()),
            mode,
        })
    }

    /// Open the log and wrap it for sharing.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry namespace is rejected by the store.
    pub fn shared(repo: Repository, mode: ModeContext) -> RslResult<Arc<Self>> {
        Self::open(repo, mode).map(Arc::new)
    }

    /// Set the name this log reports when acting as a remote.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Name of this log.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The repository the log lives in.
    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Mode context the log was opened with.
    #[must_use]
    pub fn mode(&self) -> ModeContext {
        self.mode
    }

    // -----------------------------------------------------------------------
    // Index maintenance
    // -----------------------------------------------------------------------

    async fn read_stored(&self, id: &EntryId) -> RslResult<Option<RslEntry>> {
        Ok(self.entries.get_json(&id.to_hex()).await?)
    }

    async fn read_entry(&self, id: &EntryId) -> RslResult<RslEntry> {
        let entry = self
            .read_stored(id)
            .await?
            .ok_or(RslError::EntryNotFound(*id))?;
        if entry.id != *id || !entry.is_intact() {
            return Err(RslError::IntegrityViolation {
                entry_id: *id,
                reason: "entry contents do not match id".into(),
            });
        }
        Ok(entry)
    }

    /// Bring the index up to the stored head and return a read guard.
    pub(crate) async fn load(&self) -> RslResult<RwLockReadGuard<'_, ChainIndex>> {
        let head = self.repo.refs().get(RSL_REF).await?;
        {
            let index = self.index.read().await;
            if index.head == head {
                return Ok(index);
            }
        }
        let mut index = self.index.write().await;
        if index.head != head {
            self.catch_up(&mut index, head).await?;
        }
        Ok(RwLockWriteGuard::downgrade(index))
    }

    async fn catch_up(&self, index: &mut ChainIndex, head: Option<EntryId>) -> RslResult<()> {
        let mut fresh = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            if Some(id) == index.head {
                break;
            }
            let entry = self.read_entry(&id).await?;
            if let Some(child) = fresh.last()
                && !RslEntry::follows(child, &entry)
            {
                return Err(RslError::IntegrityViolation {
                    entry_id: child.id,
                    reason: "entry does not follow its parent".into(),
                });
            }
            cursor = entry.parent_id;
            fresh.push(entry);
        }
        if cursor != index.head {
            // Walked to the root without meeting the cached head.
            *index = ChainIndex::default();
        }
        debug!(new_entries = fresh.len(), "Refreshing log index");
        for entry in fresh.into_iter().rev() {
            index.push(entry);
        }
        index.head = head;
        Ok(())
    }

    /// Persist `entries` (oldest first) and move the head from `expected`
    /// to the last of them. Returns `false` if the head had moved.
    pub(crate) async fn extend(
        &self,
        expected: Option<EntryId>,
        entries: &[RslEntry],
    ) -> RslResult<bool> {
        let Some(last) = entries.last() else {
            return Ok(true);
        };
        let mut expected_number = 0u64;
        if let Some(parent) = expected {
            let index = self.load().await?;
            match index.get(&parent) {
                Some(entry) => expected_number = entry.number,
                None => return Ok(false),
            }
        }
        let mut parent = expected;
        for entry in entries {
            expected_number = expected_number.saturating_add(1);
            if !entry.is_intact() || entry.parent_id != parent || entry.number != expected_number
            {
                return Err(RslError::IntegrityViolation {
                    entry_id: entry.id,
                    reason: "entry does not extend the chain".into(),
                });
            }
            parent = Some(entry.id);
        }
        for entry in entries {
            self.entries.set_json(&entry.id.to_hex(), entry).await?;
        }
        Ok(self
            .repo
            .refs()
            .compare_and_swap(RSL_REF, expected.as_ref(), Some(&last.id))
            .await?)
    }

    async fn append(&self, body: EntryBody, signer: Option<&KeyPair>) -> RslResult<RslEntry> {
        let (parent, number) = {
            let index = self.load().await?;
            match index.head() {
                Some(head) => (Some(head.id), head.number.saturating_add(1)),
                None => (None, 1),
            }
        };
        let mut entry = RslEntry::new(number, parent, body);
        if let Some(key) = signer {
            entry.sign(key);
        }
        if !self.extend(parent, std::slice::from_ref(&entry)).await? {
            warn!(entry_id = %entry.id.short(), "Log head moved during append");
            return Err(RslError::ConcurrentAppend);
        }
        info!(
            entry_id = %entry.id.short(),
            number = entry.number,
            entry = %entry.description(),
            "Appended log entry"
        );
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The newest entry, if the log is not empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn head(&self) -> RslResult<Option<RslEntry>> {
        Ok(self.load().await?.head().cloned())
    }

    /// Id of the newest entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn head_id(&self) -> RslResult<Option<EntryId>> {
        Ok(self.load().await?.head().map(|e| e.id))
    }

    /// Get an entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::EntryNotFound`] if the entry is not in the chain.
    pub async fn get_entry(&self, id: &EntryId) -> RslResult<RslEntry> {
        self.load()
            .await?
            .get(id)
            .cloned()
            .ok_or(RslError::EntryNotFound(*id))
    }

    /// Parent of `entry`, `None` for the first entry.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::EntryNotFound`] if the parent is not in the chain.
    pub async fn get_parent(&self, entry: &RslEntry) -> RslResult<Option<RslEntry>> {
        match &entry.parent_id {
            Some(parent) => self.get_entry(parent).await.map(Some),
            None => Ok(None),
        }
    }

    /// Whether `id` is part of the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn contains(&self, id: &EntryId) -> RslResult<bool> {
        Ok(self.load().await?.contains(id))
    }

    /// Most recent entry for `ref_name` matching `opts`.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::NotFound`] if no entry matches, and
    /// [`RslError::EntryNotFound`] if `opts.before` is not in the chain.
    pub async fn get_latest_entry(
        &self,
        ref_name: &str,
        opts: &LatestEntryOptions,
    ) -> RslResult<RslEntry> {
        let ref_name = absolute_reference(ref_name);
        self.load()
            .await?
            .latest(&ref_name, opts)?
            .cloned()
            .ok_or(RslError::NotFound(ref_name))
    }

    /// All entries for `ref_name`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn entries_for(&self, ref_name: &str) -> RslResult<Vec<RslEntry>> {
        let ref_name = absolute_reference(ref_name);
        let index = self.load().await?;
        Ok(index
            .by_ref
            .get(&ref_name)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|pos| index.chain.get(*pos).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every chain node, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn entries(&self) -> RslResult<Vec<RslEntry>> {
        Ok(self.load().await?.chain.clone())
    }

    /// Annotations that refer to `entry_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn annotations_for(&self, entry_id: &EntryId) -> RslResult<Vec<RslEntry>> {
        let index = self.load().await?;
        Ok(index
            .annotations
            .get(entry_id)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|pos| index.chain.get(*pos).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether a skip annotation refers to `entry_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be loaded.
    pub async fn is_skipped(&self, entry_id: &EntryId) -> RslResult<bool> {
        Ok(self.load().await?.skipped.contains(entry_id))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Record that `ref_name` now points at `target_id`.
    ///
    /// Unless `opts.skip_check_for_duplicate` is set, returns the existing
    /// entry without appending when the latest unskipped entry for the
    /// reference already records `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::InvalidInput`] for an overlay or malformed
    /// reference name, or a storage error if the append fails.
    pub async fn create_entry(
        &self,
        ref_name: &str,
        target_id: ObjectId,
        opts: CreateEntryOptions<'_>,
    ) -> RslResult<RslEntry> {
        let ref_name = absolute_reference(ref_name);
        if ref_name == RSL_REF {
            return Err(RslError::InvalidInput(
                "the log reference cannot be recorded in itself".into(),
            ));
        }
        let _guard = self.append_lock.lock().await;
        if !opts.skip_check_for_duplicate {
            let existing = self
                .load()
                .await?
                .latest(&ref_name, &LatestEntryOptions::unskipped())?
                .filter(|latest| latest.target_id() == Some(target_id))
                .cloned();
            if let Some(latest) = existing {
                debug!(
                    ref_name = %ref_name,
                    entry_id = %latest.id.short(),
                    "Target already recorded, skipping duplicate entry"
                );
                return Ok(latest);
            }
        }
        self.append(
            EntryBody::Reference {
                ref_name,
                target_id,
            },
            opts.signer,
        )
        .await
    }

    /// Append an annotation referring to `entry_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::InvalidInput`] if `entry_ids` is empty and
    /// [`RslError::InvalidReference`] if any id is not in the chain.
    pub async fn create_annotation(
        &self,
        entry_ids: &[EntryId],
        skip: bool,
        message: &str,
        signer: Option<&KeyPair>,
    ) -> RslResult<RslEntry> {
        if entry_ids.is_empty() {
            return Err(RslError::InvalidInput(
                "annotation must reference at least one entry".into(),
            ));
        }
        let _guard = self.append_lock.lock().await;
        {
            let index = self.load().await?;
            if let Some(missing) = entry_ids.iter().find(|id| !index.contains(id)) {
                return Err(RslError::InvalidReference(*missing));
            }
        }
        self.append(
            EntryBody::Annotation {
                referenced_entry_ids: entry_ids.iter().copied().collect::<BTreeSet<_>>(),
                skip,
                message: message.to_string(),
            },
            signer,
        )
        .await
    }

    /// Record a propagation into `ref_name`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the append fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_propagation_entry(
        &self,
        ref_name: &str,
        target_id: ObjectId,
        upstream_repository: &str,
        upstream_entry_id: EntryId,
        directive: &str,
        content_digest: ContentHash,
        signer: Option<&KeyPair>,
    ) -> RslResult<RslEntry> {
        let _guard = self.append_lock.lock().await;
        self.append(
            EntryBody::Propagation {
                ref_name: absolute_reference(ref_name),
                target_id,
                upstream_repository: upstream_repository.to_string(),
                upstream_entry_id,
                directive: directive.to_string(),
                content_digest,
            },
            signer,
        )
        .await
    }

    /// Commit `tree` on top of `ref_name` and record the new tip in the log
    /// as one unit.
    ///
    /// If the log append fails the reference is moved back, so the commit
    /// is never visible without its entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RefConflict`] (wrapped) if the reference
    /// moved concurrently, or the append error after rolling back.
    pub async fn commit_and_record(
        &self,
        ref_name: &str,
        tree: &Tree,
        message: &str,
        signer: Option<&KeyPair>,
    ) -> RslResult<(ObjectId, RslEntry)> {
        let ref_name = absolute_reference(ref_name);
        let parent = self.repo.ref_tip(&ref_name).await?;
        let commit = self
            .repo
            .create_commit(parent, tree, message, signer)
            .await?;
        let refs = self.repo.refs();
        if !refs
            .compare_and_swap(&ref_name, parent.as_ref(), Some(&commit))
            .await?
        {
            return Err(StorageError::RefConflict(ref_name).into());
        }
        let opts = CreateEntryOptions {
            skip_check_for_duplicate: false,
            signer,
        };
        match self.create_entry(&ref_name, commit, opts).await {
            Ok(entry) => Ok((commit, entry)),
            Err(e) => {
                match refs
                    .compare_and_swap(&ref_name, Some(&commit), parent.as_ref())
                    .await
                {
                    Ok(true) => warn!(ref_name = %ref_name, error = %e, "Rolled back reference after failed append"),
                    Ok(false) => error!(ref_name = %ref_name, "Reference moved before rollback"),
                    Err(rollback) => error!(ref_name = %ref_name, error = %rollback, "Rollback failed"),
                }
                Err(e)
            },
        }
    }

    /// Record an entry for an existing commit of `ref_name` that may be
    /// older than its tip. Only available in eval mode.
    ///
    /// # Errors
    ///
    /// Returns [`RslError::Mode`] outside eval mode,
    /// [`RslError::NotFound`] if the reference does not exist and
    /// [`RslError::CommitNotInRef`] if `commit` is not reachable from its tip.
    pub async fn record_entry_at_commit(
        &self,
        ref_name: &str,
        commit: ObjectId,
        opts: CreateEntryOptions<'_>,
    ) -> RslResult<RslEntry> {
        self.mode.require(Mode::Eval, "record-entry-at-commit")?;
        let ref_name = absolute_reference(ref_name);
        let tip = self
            .repo
            .ref_tip(&ref_name)
            .await?
            .ok_or_else(|| RslError::NotFound(ref_name.clone()))?;
        if !self.repo.is_ancestor(&commit, &tip).await? {
            return Err(RslError::CommitNotInRef {
                commit: commit.to_hex(),
                ref_name,
            });
        }
        self.create_entry(&ref_name, commit, opts).await
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Walk the stored chain from the head and report every inconsistency.
    ///
    /// # Errors
    ///
    /// Returns an error only if storage cannot be read.
    pub async fn verify_chain(&self) -> RslResult<ChainVerificationResult> {
        let mut issues = Vec::new();
        let mut entries_verified: usize = 0;
        let mut cursor = self.repo.refs().get(RSL_REF).await?;
        let mut child: Option<RslEntry> = None;

        while let Some(id) = cursor {
            let Some(entry) = self.read_stored(&id).await? else {
                if let Some(child) = &child {
                    issues.push(ChainIssue::MissingParent {
                        entry_id: child.id,
                        parent_id: id,
                    });
                }
                break;
            };
            entries_verified = entries_verified.saturating_add(1);
            if entry.id != id || !entry.is_intact() {
                issues.push(ChainIssue::TamperedEntry { entry_id: id });
            }
            if let Some(child) = &child {
                let expected = entry.number.saturating_add(1);
                if child.number != expected {
                    issues.push(ChainIssue::BadNumbering {
                        entry_id: child.id,
                        expected,
                        actual: child.number,
                    });
                }
            }
            if entry.parent_id.is_none() && entry.number != 1 {
                issues.push(ChainIssue::InvalidGenesis { entry_id: id });
            }
            cursor = entry.parent_id;
            child = Some(entry);
        }

        if !issues.is_empty() {
            warn!(issues = issues.len(), "Log chain verification found issues");
        }
        Ok(ChainVerificationResult {
            valid: issues.is_empty(),
            entries_verified,
            issues,
        })
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
