//! Named references with compare-and-swap updates.

use std::sync::Arc;

use reftrust_crypto::ContentHash;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::kv::{KvStore, ScopedKvStore};
use crate::object::ObjectId;

const NS_REFS: &str = "refs";

/// Reference storage: reference name to commit id.
///
/// Values are stored as hex so the compare-and-swap comparison is a plain
/// byte comparison in the underlying store.
#[derive(Debug, Clone)]
pub struct RefStore {
    store: ScopedKvStore,
}

fn encode(id: &ObjectId) -> Vec<u8> {
    id.to_hex().into_bytes()
}

fn decode(name: &str, bytes: &[u8]) -> StorageResult<ObjectId> {
    let hex = std::str::from_utf8(bytes)
        .map_err(|e| StorageError::Corrupt(format!("ref {name}: {e}")))?;
    ContentHash::from_hex(hex).map_err(|e| StorageError::Corrupt(format!("ref {name}: {e}")))
}

fn validate_ref_name(name: &str) -> StorageResult<()> {
    if !name.starts_with("refs/") || name.ends_with('/') || name.contains("//") {
        return Err(StorageError::InvalidKey(format!(
            "invalid reference name '{name}'"
        )));
    }
    Ok(())
}

impl RefStore {
    /// Create a reference store on `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace is rejected by the store.
    pub fn new(store: Arc<dyn KvStore>) -> StorageResult<Self> {
        Ok(Self {
            store: ScopedKvStore::new(store, NS_REFS)?,
        })
    }

    /// Current target of `name`, if the reference exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the stored value is corrupt.
    pub async fn get(&self, name: &str) -> StorageResult<Option<ObjectId>> {
        validate_ref_name(name)?;
        match self.store.get(name).await? {
            Some(bytes) => decode(name, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Unconditionally point `name` at `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the write fails.
    pub async fn set(&self, name: &str, target: &ObjectId) -> StorageResult<()> {
        validate_ref_name(name)?;
        self.store.set(name, encode(target)).await?;
        debug!(reference = name, target = %target.short(), "Reference updated");
        Ok(())
    }

    /// Atomically move `name` from `expected` to `new`.
    ///
    /// `None` as `expected` means "the reference must not exist"; `None` as
    /// `new` deletes it. Returns `false` without writing if the current
    /// value differs from `expected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the store fails.
    pub async fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<&ObjectId>,
        new: Option<&ObjectId>,
    ) -> StorageResult<bool> {
        validate_ref_name(name)?;
        let expected_bytes = expected.map(encode);
        let swapped = self
            .store
            .compare_and_swap(name, expected_bytes.as_deref(), new.map(encode))
            .await?;
        if swapped {
            debug!(
                reference = name,
                target = %new.map(ContentHash::short).unwrap_or_default(),
                "Reference swapped"
            );
        }
        Ok(swapped)
    }

    /// Delete `name`. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the store fails.
    pub async fn delete(&self, name: &str) -> StorageResult<bool> {
        validate_ref_name(name)?;
        self.store.delete(name).await
    }

    /// All reference names, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self) -> StorageResult<Vec<String>> {
        self.store.list_keys().await
    }
}
