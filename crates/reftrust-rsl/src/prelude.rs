//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_rsl::prelude::*;` to import all essential types.

// Errors
pub use crate::{RslError, RslResult};

// Entry types
pub use crate::{EntryBody, EntryId, RslEntry};

// Log and verification
pub use crate::{
    ChainIssue, ChainVerificationResult, CreateEntryOptions, LatestEntryOptions,
    ReferenceStateLog,
};

// Remote synchronization
pub use crate::{PullOutcome, PushOutcome, RemoteLog, RemoteStatus};
