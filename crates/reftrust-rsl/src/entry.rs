//! Log entry types.
//!
//! Every chain node (reference entry, annotation, propagation entry) is an
//! [`RslEntry`]. Its id is a hash over its number, its parent and its body,
//! so rewriting any historical node changes every id after it.

use std::collections::BTreeSet;

use reftrust_crypto::{ContentHash, DetachedSignature, KeyId, KeyPair, PublicKey};
use reftrust_storage::ObjectId;
use serde::{Deserialize, Serialize};

/// Identifier of a log entry.
pub type EntryId = ContentHash;

const ENTRY_DOMAIN: &str = "reftrust.rsl.entry.v1";

/// What a chain node records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryBody {
    /// A reference was moved to a new target.
    Reference {
        /// Fully qualified reference name.
        ref_name: String,
        /// Commit the reference now points at.
        target_id: ObjectId,
    },
    /// A note about earlier entries, optionally marking them skipped.
    Annotation {
        /// Entries the annotation refers to (never empty).
        referenced_entry_ids: BTreeSet<EntryId>,
        /// Whether the referenced entries should be ignored when resolving
        /// the latest state of their references.
        skip: bool,
        /// Free-form message.
        message: String,
    },
    /// A reference was updated by copying content from an upstream
    /// repository under a propagation directive.
    Propagation {
        /// Downstream reference that was updated.
        ref_name: String,
        /// Commit the downstream reference now points at.
        target_id: ObjectId,
        /// Location of the upstream repository.
        upstream_repository: String,
        /// Upstream log entry whose content was propagated.
        upstream_entry_id: EntryId,
        /// Name of the directive that was applied.
        directive: String,
        /// Digest of the propagated subtree.
        content_digest: ContentHash,
    },
}

impl EntryBody {
    fn tag(&self) -> u8 {
        match self {
            Self::Reference { .. } => 0,
            Self::Annotation { .. } => 1,
            Self::Propagation { .. } => 2,
        }
    }
}

/// A node in the reference state log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RslEntry {
    /// Content-derived id.
    pub id: EntryId,
    /// 1-based position in the chain.
    pub number: u64,
    /// Id of the previous node, `None` for the first.
    pub parent_id: Option<EntryId>,
    /// What this node records.
    #[serde(flatten)]
    pub body: EntryBody,
    /// Detached signatures over the id.
    #[serde(default)]
    pub signatures: Vec<DetachedSignature>,
}

fn write_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

impl RslEntry {
    /// Create an unsigned entry with its id computed.
    #[must_use]
    pub fn new(number: u64, parent_id: Option<EntryId>, body: EntryBody) -> Self {
        let mut entry = Self {
            id: ContentHash::zero(),
            number,
            parent_id,
            body,
            signatures: Vec::new(),
        };
        entry.id = entry.compute_id();
        entry
    }

    /// Get the data the id is derived from.
    #[must_use]
    pub fn signing_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.number.to_le_bytes());
        match &self.parent_id {
            Some(parent) => {
                data.push(1);
                data.extend_from_slice(parent.as_bytes());
            },
            None => data.push(0),
        }
        data.push(self.body.tag());
        match &self.body {
            EntryBody::Reference {
                ref_name,
                target_id,
            } => {
                write_length_prefixed(&mut data, ref_name.as_bytes());
                data.extend_from_slice(target_id.as_bytes());
            },
            EntryBody::Annotation {
                referenced_entry_ids,
                skip,
                message,
            } => {
                data.extend_from_slice(&(referenced_entry_ids.len() as u64).to_le_bytes());
                for id in referenced_entry_ids {
                    data.extend_from_slice(id.as_bytes());
                }
                data.push(u8::from(*skip));
                write_length_prefixed(&mut data, message.as_bytes());
            },
            EntryBody::Propagation {
                ref_name,
                target_id,
                upstream_repository,
                upstream_entry_id,
                directive,
                content_digest,
            } => {
                write_length_prefixed(&mut data, ref_name.as_bytes());
                data.extend_from_slice(target_id.as_bytes());
                write_length_prefixed(&mut data, upstream_repository.as_bytes());
                data.extend_from_slice(upstream_entry_id.as_bytes());
                write_length_prefixed(&mut data, directive.as_bytes());
                data.extend_from_slice(content_digest.as_bytes());
            },
        }
        data
    }

    /// Recompute the id from the entry contents.
    #[must_use]
    pub fn compute_id(&self) -> EntryId {
        ContentHash::hash_with_domain(ENTRY_DOMAIN, &self.signing_data())
    }

    /// Whether the stored id matches the contents.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.id == self.compute_id()
    }

    /// Check if this entry directly follows `previous`.
    #[must_use]
    pub fn follows(&self, previous: &RslEntry) -> bool {
        self.parent_id == Some(previous.id) && self.number == previous.number.saturating_add(1)
    }

    /// Add (or replace) a signature by `key` over the id.
    pub fn sign(&mut self, key: &KeyPair) {
        let signature = key.sign_detached(self.id.as_bytes());
        self.signatures.retain(|s| s.key_id != signature.key_id);
        self.signatures.push(signature);
    }

    /// Ids of the keys in `trusted` that produced a valid signature.
    #[must_use]
    pub fn valid_signers(&self, trusted: &[PublicKey]) -> BTreeSet<KeyId> {
        trusted
            .iter()
            .filter(|key| {
                self.signatures
                    .iter()
                    .any(|s| s.verify(key, self.id.as_bytes()).is_ok())
            })
            .map(PublicKey::key_id)
            .collect()
    }

    /// Reference this entry moves, if it is not an annotation.
    #[must_use]
    pub fn ref_name(&self) -> Option<&str> {
        match &self.body {
            EntryBody::Reference { ref_name, .. } | EntryBody::Propagation { ref_name, .. } => {
                Some(ref_name)
            },
            EntryBody::Annotation { .. } => None,
        }
    }

    /// Target this entry records, if it is not an annotation.
    #[must_use]
    pub fn target_id(&self) -> Option<ObjectId> {
        match &self.body {
            EntryBody::Reference { target_id, .. } | EntryBody::Propagation { target_id, .. } => {
                Some(*target_id)
            },
            EntryBody::Annotation { .. } => None,
        }
    }

    /// Whether this is an annotation.
    #[must_use]
    pub fn is_annotation(&self) -> bool {
        matches!(self.body, EntryBody::Annotation { .. })
    }

    /// Whether this is a propagation entry.
    #[must_use]
    pub fn is_propagation(&self) -> bool {
        matches!(self.body, EntryBody::Propagation { .. })
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(&self) -> String {
        match &self.body {
            EntryBody::Reference {
                ref_name,
                target_id,
            } => format!("{ref_name} -> {}", target_id.short()),
            EntryBody::Annotation {
                referenced_entry_ids,
                skip,
                ..
            } => format!(
                "annotation on {} entries{}",
                referenced_entry_ids.len(),
                if *skip { " (skip)" } else { "" }
            ),
            EntryBody::Propagation {
                ref_name,
                target_id,
                directive,
                ..
            } => format!("{ref_name} -> {} via {directive}", target_id.short()),
        }
    }
}
