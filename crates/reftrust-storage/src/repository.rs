//! Repository handle: objects, references and ancestry queries.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use reftrust_crypto::KeyPair;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvStore, MemoryKvStore};
use crate::object::{Commit, ObjectId, ObjectStore, Tree, normalize_path};
use crate::refs::RefStore;

/// A repository: content-addressed objects plus named references.
///
/// Cloning is cheap; clones share the same backing store.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KvStore>,
    objects: ObjectStore,
    refs: RefStore,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    /// Open a repository on an existing key-value store.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage namespaces are rejected.
    pub fn new(store: Arc<dyn KvStore>) -> StorageResult<Self> {
        Ok(Self {
            objects: ObjectStore::new(Arc::clone(&store))?,
            refs: RefStore::new(Arc::clone(&store))?,
            store,
        })
    }

    /// A fresh repository backed by memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage namespaces are rejected.
    pub fn in_memory() -> StorageResult<Self> {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    /// The backing key-value store, for components that keep their own
    /// namespaces next to the objects.
    #[must_use]
    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    /// Object storage.
    #[must_use]
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Reference storage.
    #[must_use]
    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Current tip of `reference`, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be read.
    pub async fn ref_tip(&self, reference: &str) -> StorageResult<Option<ObjectId>> {
        self.refs.get(reference).await
    }

    /// Tree snapshot of `commit`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the commit or its tree is missing.
    pub async fn tree_at(&self, commit: &ObjectId) -> StorageResult<Tree> {
        let commit = self.objects.get_commit(commit).await?;
        self.objects.get_tree(&commit.tree).await
    }

    /// Tree at the tip of `reference`, or an empty tree if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference or its objects cannot be read.
    pub async fn tree_at_ref(&self, reference: &str) -> StorageResult<Tree> {
        match self.ref_tip(reference).await? {
            Some(tip) => self.tree_at(&tip).await,
            None => Ok(Tree::new()),
        }
    }

    /// Contents of `path` in `commit`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit, tree or blob cannot be read.
    pub async fn read_file(&self, commit: &ObjectId, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let tree = self.tree_at(commit).await?;
        match tree.entries.get(normalize_path(path)) {
            Some(blob) => self.objects.get_blob(blob).await.map(Some),
            None => Ok(None),
        }
    }

    /// Whether `ancestor` is reachable from `descendant` through parent
    /// links. A commit is its own ancestor.
    ///
    /// # Errors
    ///
    /// Returns an error if a commit on the walk cannot be read.
    pub async fn is_ancestor(
        &self,
        ancestor: &ObjectId,
        descendant: &ObjectId,
    ) -> StorageResult<bool> {
        let mut queue = VecDeque::from([*descendant]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if id == *ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            let commit = self.objects.get_commit(&id).await?;
            queue.extend(commit.parents);
        }
        Ok(false)
    }

    /// Store `tree` and a commit on top of `parent` without moving any
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns an error if an object cannot be written.
    pub async fn create_commit(
        &self,
        parent: Option<ObjectId>,
        tree: &Tree,
        message: &str,
        signer: Option<&KeyPair>,
    ) -> StorageResult<ObjectId> {
        let tree_id = self.objects.put_tree(tree).await?;
        let mut commit = Commit::new(tree_id, parent.into_iter().collect(), message);
        if let Some(key) = signer {
            commit.sign(key);
        }
        self.objects.put_commit(&commit).await
    }

    /// Commit `tree` on top of the tip of `reference` and advance it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RefConflict`] if the reference moved during
    /// the update.
    pub async fn commit_tree(
        &self,
        reference: &str,
        tree: &Tree,
        message: &str,
        signer: Option<&KeyPair>,
    ) -> StorageResult<ObjectId> {
        let parent = self.ref_tip(reference).await?;
        let id = self.create_commit(parent, tree, message, signer).await?;
        if !self
            .refs
            .compare_and_swap(reference, parent.as_ref(), Some(&id))
            .await?
        {
            return Err(StorageError::RefConflict(reference.to_string()));
        }
        debug!(reference, commit = %id.short(), "Committed tree");
        Ok(id)
    }

    /// Write `files` on top of the tip of `reference` and commit.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RefConflict`] if the reference moved during
    /// the update.
    pub async fn write_files(
        &self,
        reference: &str,
        files: &[(&str, &[u8])],
        message: &str,
        signer: Option<&KeyPair>,
    ) -> StorageResult<ObjectId> {
        let mut tree = self.tree_at_ref(reference).await?;
        for (path, bytes) in files {
            let blob = self.objects.put_blob(bytes.to_vec()).await?;
            tree.insert(path, blob);
        }
        self.commit_tree(reference, &tree, message, signer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_files_builds_history() {
        let repo = Repository::in_memory().unwrap();
        let first = repo
            .write_files("refs/heads/main", &[("a.txt", b"one")], "first", None)
            .await
            .unwrap();
        let second = repo
            .write_files("refs/heads/main", &[("b.txt", b"two")], "second", None)
            .await
            .unwrap();

        assert_eq!(repo.ref_tip("refs/heads/main").await.unwrap(), Some(second));
        let tree = repo.tree_at(&second).await.unwrap();
        assert_eq!(tree.entries.len(), 2);
        assert_eq!(
            repo.read_file(&second, "a.txt").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert!(repo.read_file(&first, "b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_is_ancestor() {
        let repo = Repository::in_memory().unwrap();
        let a = repo
            .write_files("refs/heads/main", &[("f", b"1")], "a", None)
            .await
            .unwrap();
        let b = repo
            .write_files("refs/heads/main", &[("f", b"2")], "b", None)
            .await
            .unwrap();
        let side = repo
            .write_files("refs/heads/side", &[("g", b"x")], "side", None)
            .await
            .unwrap();

        assert!(repo.is_ancestor(&a, &b).await.unwrap());
        assert!(repo.is_ancestor(&b, &b).await.unwrap());
        assert!(!repo.is_ancestor(&b, &a).await.unwrap());
        assert!(!repo.is_ancestor(&side, &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_tree_detects_concurrent_update() {
        let repo = Repository::in_memory().unwrap();
        let base = repo
            .write_files("refs/heads/main", &[("f", b"1")], "base", None)
            .await
            .unwrap();
        // Someone else moves the ref after we read it.
        let other = repo
            .create_commit(Some(base), &Tree::new(), "other", None)
            .await
            .unwrap();
        repo.refs()
            .compare_and_swap("refs/heads/main", Some(&base), Some(&other))
            .await
            .unwrap();

        let stale = repo
            .create_commit(Some(base), &Tree::new(), "stale", None)
            .await
            .unwrap();
        let swapped = repo
            .refs()
            .compare_and_swap("refs/heads/main", Some(&base), Some(&stale))
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[tokio::test]
    async fn test_signed_commit() {
        let repo = Repository::in_memory().unwrap();
        let key = KeyPair::generate();
        let id = repo
            .write_files("refs/heads/main", &[("f", b"1")], "signed", Some(&key))
            .await
            .unwrap();
        let commit = repo.objects().get_commit(&id).await.unwrap();
        assert_eq!(commit.signatures.len(), 1);
        commit.signatures[0]
            .verify(&key.public_key(), id.as_bytes())
            .unwrap();
    }
}
