//! Content-addressed objects: blobs, trees and commits.
//!
//! Trees are flat: a sorted map from slash-separated file paths to blob ids.
//! A "directory" is simply the set of paths sharing a prefix, which keeps
//! subtree copy and comparison to plain map operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use reftrust_crypto::{ContentHash, DetachedSignature, KeyId, KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvStore, ScopedKvStore};

/// Identifier of a stored object.
pub type ObjectId = ContentHash;

const NS_BLOBS: &str = "objects:blobs";
const NS_TREES: &str = "objects:trees";
const NS_COMMITS: &str = "objects:commits";

const BLOB_DOMAIN: &str = "reftrust.blob.v1";
const TREE_DOMAIN: &str = "reftrust.tree.v1";
const COMMIT_DOMAIN: &str = "reftrust.commit.v1";

/// Version byte mixed into commit signing data.
const COMMIT_FORMAT_VERSION: u8 = 0x01;

/// Strip leading and trailing slashes from a tree path.
#[must_use]
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

fn write_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Id a blob with these bytes would have.
#[must_use]
pub fn blob_id(bytes: &[u8]) -> ObjectId {
    ContentHash::hash_with_domain(BLOB_DOMAIN, bytes)
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A snapshot of files: path to blob id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// File entries keyed by normalized path.
    pub entries: BTreeMap<String, ObjectId>,
}

impl Tree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tree has no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a file.
    pub fn insert(&mut self, path: &str, blob: ObjectId) {
        self.entries
            .insert(normalize_path(path).to_string(), blob);
    }

    /// Content id of this tree (also its digest).
    #[must_use]
    pub fn id(&self) -> ObjectId {
        let mut data = Vec::new();
        for (path, blob) in &self.entries {
            write_length_prefixed(&mut data, path.as_bytes());
            data.extend_from_slice(blob.as_bytes());
        }
        ContentHash::hash_with_domain(TREE_DOMAIN, &data)
    }

    /// Files under the directory `path`, with the prefix stripped.
    ///
    /// An empty path selects the whole tree.
    #[must_use]
    pub fn subtree(&self, path: &str) -> Tree {
        let dir = normalize_path(path);
        if dir.is_empty() {
            return self.clone();
        }
        let prefix = format!("{dir}/");
        let entries = self
            .entries
            .iter()
            .filter_map(|(p, id)| p.strip_prefix(&prefix).map(|rest| (rest.to_string(), *id)))
            .collect();
        Tree { entries }
    }

    /// A copy of this tree with the directory `path` replaced by `subtree`.
    #[must_use]
    pub fn with_subtree(&self, path: &str, subtree: &Tree) -> Tree {
        let dir = normalize_path(path);
        if dir.is_empty() {
            return subtree.clone();
        }
        let prefix = format!("{dir}/");
        let mut entries: BTreeMap<String, ObjectId> = self
            .entries
            .iter()
            .filter(|(p, _)| !p.starts_with(&prefix))
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        for (p, id) in &subtree.entries {
            entries.insert(format!("{prefix}{p}"), *id);
        }
        Tree { entries }
    }

    /// Paths whose content differs between `old` and `new` (added, removed
    /// or modified).
    #[must_use]
    pub fn changed_paths(old: &Tree, new: &Tree) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (path, id) in &new.entries {
            if old.entries.get(path) != Some(id) {
                changed.insert(path.clone());
            }
        }
        for path in old.entries.keys() {
            if !new.entries.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A commit: a tree, its parents and a message, optionally signed.
///
/// Signatures cover the commit id and are not part of it, so adding a
/// signature never changes the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Tree snapshot.
    pub tree: ObjectId,
    /// Parent commits (empty for a root commit).
    pub parents: Vec<ObjectId>,
    /// Commit message.
    pub message: String,
    /// Detached signatures over the commit id.
    #[serde(default)]
    pub signatures: Vec<DetachedSignature>,
}

impl Commit {
    /// Create an unsigned commit.
    #[must_use]
    pub fn new(tree: ObjectId, parents: Vec<ObjectId>, message: impl Into<String>) -> Self {
        Self {
            tree,
            parents,
            message: message.into(),
            signatures: Vec::new(),
        }
    }

    fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(COMMIT_FORMAT_VERSION);
        data.extend_from_slice(self.tree.as_bytes());
        data.extend_from_slice(&(self.parents.len() as u64).to_le_bytes());
        for parent in &self.parents {
            data.extend_from_slice(parent.as_bytes());
        }
        write_length_prefixed(&mut data, self.message.as_bytes());
        data
    }

    /// Content id of this commit.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        ContentHash::hash_with_domain(COMMIT_DOMAIN, &self.signing_data())
    }

    /// Add (or replace) a signature by `key`.
    pub fn sign(&mut self, key: &KeyPair) {
        let signature = key.sign_detached(self.id().as_bytes());
        self.signatures.retain(|s| s.key_id != signature.key_id);
        self.signatures.push(signature);
    }

    /// Ids of the keys in `trusted` that produced a valid signature.
    #[must_use]
    pub fn valid_signers(&self, trusted: &[PublicKey]) -> BTreeSet<KeyId> {
        let id = self.id();
        trusted
            .iter()
            .filter(|key| {
                self.signatures
                    .iter()
                    .any(|s| s.verify(key, id.as_bytes()).is_ok())
            })
            .map(PublicKey::key_id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Content-addressed object storage over a [`KvStore`].
#[derive(Debug, Clone)]
pub struct ObjectStore {
    blobs: ScopedKvStore,
    trees: ScopedKvStore,
    commits: ScopedKvStore,
}

impl ObjectStore {
    /// Create an object store on `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the object namespaces are rejected by the store.
    pub fn new(store: Arc<dyn KvStore>) -> StorageResult<Self> {
        Ok(Self {
            blobs: ScopedKvStore::new(Arc::clone(&store), NS_BLOBS)?,
            trees: ScopedKvStore::new(Arc::clone(&store), NS_TREES)?,
            commits: ScopedKvStore::new(store, NS_COMMITS)?,
        })
    }

    /// Store a blob and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put_blob(&self, bytes: Vec<u8>) -> StorageResult<ObjectId> {
        let id = blob_id(&bytes);
        self.blobs.set(&id.to_hex(), bytes).await?;
        Ok(id)
    }

    /// Read a blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if absent, [`StorageError::Corrupt`]
    /// if the bytes do not match the id.
    pub async fn get_blob(&self, id: &ObjectId) -> StorageResult<Vec<u8>> {
        let bytes = self
            .blobs
            .get(&id.to_hex())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("blob {id}")))?;
        if blob_id(&bytes) != *id {
            return Err(StorageError::Corrupt(id.to_hex()));
        }
        Ok(bytes)
    }

    /// Store a tree and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn put_tree(&self, tree: &Tree) -> StorageResult<ObjectId> {
        let id = tree.id();
        self.trees.set_json(&id.to_hex(), tree).await?;
        Ok(id)
    }

    /// Read a tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if absent, [`StorageError::Corrupt`]
    /// if the content does not match the id.
    pub async fn get_tree(&self, id: &ObjectId) -> StorageResult<Tree> {
        let tree: Tree = self
            .trees
            .get_json(&id.to_hex())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("tree {id}")))?;
        if tree.id() != *id {
            return Err(StorageError::Corrupt(id.to_hex()));
        }
        Ok(tree)
    }

    /// Store a commit and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn put_commit(&self, commit: &Commit) -> StorageResult<ObjectId> {
        let id = commit.id();
        self.commits.set_json(&id.to_hex(), commit).await?;
        debug!(commit = %id.short(), parents = commit.parents.len(), "Stored commit");
        Ok(id)
    }

    /// Read a commit.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if absent, [`StorageError::Corrupt`]
    /// if the content does not match the id.
    pub async fn get_commit(&self, id: &ObjectId) -> StorageResult<Commit> {
        let commit: Commit = self
            .commits
            .get_json(&id.to_hex())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("commit {id}")))?;
        if commit.id() != *id {
            return Err(StorageError::Corrupt(id.to_hex()));
        }
        Ok(commit)
    }

    /// Whether a commit with this id is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn has_commit(&self, id: &ObjectId) -> StorageResult<bool> {
        Ok(self.commits.get(&id.to_hex()).await?.is_some())
    }

    /// Copy every object of `other` missing here. Returns how many objects
    /// were copied.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be read or written.
    pub async fn fetch_from(&self, other: &ObjectStore) -> StorageResult<usize> {
        let mut copied = 0usize;
        for (ours, theirs) in [
            (&self.blobs, &other.blobs),
            (&self.trees, &other.trees),
            (&self.commits, &other.commits),
        ] {
            for key in theirs.list_keys().await? {
                if ours.get(&key).await?.is_some() {
                    continue;
                }
                if let Some(value) = theirs.get(&key).await? {
                    ours.set(&key, value).await?;
                    copied = copied.saturating_add(1);
                }
            }
        }
        debug!(copied, "Fetched objects");
        Ok(copied)
    }
}
