//! Reftrust Core - foundation types shared by every reftrust crate.
//!
//! This crate provides:
//! - The [`ErrorKind`] taxonomy that every crate error maps onto
//! - [`ModeContext`], the explicit developer/eval mode gate
//! - Well-known reference names used by the trust overlay

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod mode;
pub mod refs;

pub use error::{Classify, ErrorKind};
pub use mode::{Mode, ModeContext, ModeRestricted};
pub use refs::{ATTESTATIONS_REF, POLICY_REF, RSL_REF, absolute_reference, is_overlay_ref};
