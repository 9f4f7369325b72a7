//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_policy::prelude::*;` to import all essential types.

// Errors
pub use crate::{PolicyError, PolicyResult};

// Documents
pub use crate::{
    GlobalRule, Metadata, Principal, PropagationDirective, RootMetadata, Rule, TargetsMetadata,
};

// Resolution and decision
pub use crate::{AuthorizationRequest, Decision, PolicyState, decide};

// Persistence
pub use crate::{ApplyOptions, PolicyStore, RepositoryResolver};
