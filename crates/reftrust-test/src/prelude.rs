//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_test::prelude::*;` to import all essential types.

pub use crate::fixtures::*;
pub use crate::harness::*;
pub use crate::mocks::*;

pub use reftrust_core::ModeContext;
pub use reftrust_crypto::KeyPair;
