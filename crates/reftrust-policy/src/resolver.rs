//! Access to other repositories by location.

use std::sync::Arc;

use async_trait::async_trait;
use reftrust_rsl::ReferenceStateLog;

use crate::error::PolicyResult;

/// Opens the log of a repository named by its location.
///
/// Used to reach controller repositories and propagation upstreams.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    /// Log of the repository at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PolicyError::RepositoryNotFound`] if nothing is
    /// known at `location`.
    async fn resolve(&self, location: &str) -> PolicyResult<Arc<ReferenceStateLog>>;
}
