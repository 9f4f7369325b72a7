//! Reftrust Test - shared test utilities.
//!
//! Fixtures build in-memory repositories with a recorded policy, mocks
//! stand in for remote logs and repository resolvers.
//!
//! ```toml
//! [dev-dependencies]
//! reftrust-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use reftrust_test::prelude::*;
//!
//! #[tokio::test]
//! async fn test_signed_push() {
//!     let repo = TestRepo::new(ModeContext::strict());
//!     let alice = KeyPair::generate();
//!     repo.apply_policy(&test_root(&repo.owner), &test_rule_set(&[("alice", &alice)], 1)).await;
//!     repo.record("main", &[("a.txt", b"a")], &alice).await;
//!     assert!(repo.verifier().verify_ref("main", &Default::default()).await.unwrap().is_authorized());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
