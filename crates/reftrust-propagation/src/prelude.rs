//! Prelude module - commonly used types for convenient import.
//!
//! Use `use reftrust_propagation::prelude::*;` to import all essential types.

pub use crate::{
    PropagationEngine, PropagationError, PropagationOptions, PropagationOutcome,
    PropagationReport, PropagationResult,
};
