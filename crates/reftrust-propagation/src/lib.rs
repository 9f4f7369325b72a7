//! Reftrust Propagation - copies trusted upstream content downstream.
//!
//! A propagation directive in the root of trust names an upstream
//! repository, reference and path, and the downstream reference and path
//! the content lands under. Each pass of the [`PropagationEngine`]:
//!
//! - reads the latest unskipped upstream log entry for the reference
//! - compares the upstream subtree with what was last propagated
//! - commits the new content downstream and appends a propagation entry
//!   recording the upstream entry and the subtree digest
//!
//! While the upstream digest matches the last propagated one the directive
//! is unchanged, whatever the downstream path holds. Once the upstream
//! moves on, a downstream path edited locally since its last propagation is
//! a [`PropagationError::Conflict`] and nothing is overwritten. An upstream
//! reference with no recorded state is reported per directive and does not
//! stop the pass.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod engine;
mod error;

pub use engine::{PropagationEngine, PropagationOptions, PropagationOutcome, PropagationReport};
pub use error::{PropagationError, PropagationResult};
