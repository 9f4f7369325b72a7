//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_verify::prelude::*;` to import all essential types.

pub use crate::{Verdict, Verifier, VerifyError, VerifyOptions, VerifyResult};
