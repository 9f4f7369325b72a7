//! Reftrust Policy - root of trust, rules and authorization.
//!
//! This crate provides:
//! - Root-of-trust and rule-set documents carried in signed envelopes
//! - Persistence of policy versions on the policy reference, each recorded
//!   in the reference state log
//! - Root-chain verification: every root version must be signed by a
//!   threshold of the previous version's root keys
//! - First-match rule resolution over reference and file patterns
//! - The authorization decision over direct signatures, witnessed
//!   approvals and team hats
//! - Delegation to controller repositories
//!
//! # Example
//!
//! ```
//! use reftrust_crypto::{ContentHash, KeyPair};
//! use reftrust_policy::{
//!     AuthorizationRequest, PolicyState, Principal, RootMetadata, Rule, TargetsMetadata, decide,
//! };
//!
//! let alice = KeyPair::generate();
//! let root = RootMetadata::new(vec![alice.public_key()], 1);
//! let targets = TargetsMetadata::new()
//!     .with_principal("alice", Principal::person("alice", vec![alice.public_key()]))
//!     .with_rule(Rule::new("protect-main", ["git:main"], ["alice"], 1));
//! let state = PolicyState::new(root, targets).unwrap();
//!
//! let request = AuthorizationRequest::new("main", ContentHash::hash(b"commit"))
//!     .with_signers([alice.key_id()]);
//! assert!(decide(&state, &request).authorized);
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod decide;
mod error;
mod metadata;
mod pattern;
mod resolver;
mod state;
mod store;

pub use decide::{AuthorizationRequest, Decision, RuleOutcome, RuleScope, decide};
pub use error::{PolicyError, PolicyResult};
pub use metadata::{
    ControllerRepository, DEFAULT_APP_NAME, GlobalRule, Metadata, NetworkRepository, Principal,
    PropagationDirective, ROOT_PAYLOAD_TYPE, RootMetadata, Rule, TARGETS_PAYLOAD_TYPE,
    TargetsMetadata,
};
pub use pattern::{Pattern, PatternKind};
pub use resolver::RepositoryResolver;
pub use state::{CONTROLLER_SEPARATOR, ControllerPolicy, PolicyState, ResolvedPrincipal};
pub use store::{ApplyOptions, PolicyStore, ROOT_PATH, TARGETS_PATH};
