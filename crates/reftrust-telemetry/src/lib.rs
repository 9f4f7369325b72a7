//! Reftrust Telemetry - logging setup and request correlation.
//!
//! This crate provides:
//! - Subscriber setup in pretty, compact, JSON or full format, to a
//!   standard stream or rolling files
//! - [`RequestContext`] for correlating the log output of one operation
//!
//! # Example
//!
//! ```rust,no_run
//! use reftrust_telemetry::{LogConfig, LogFormat, RequestContext, setup_logging};
//!
//! # fn main() -> Result<(), reftrust_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("reftrust_rsl=debug");
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("verifier")
//!     .with_operation("verify-ref")
//!     .with_ref("refs/heads/main");
//! let _span = ctx.span().entered();
//! tracing::info!("Verifying");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::{RequestContext, RequestGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
