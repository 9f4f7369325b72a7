//! The propagation pass.

use std::future::Future;
use std::sync::Arc;

use reftrust_core::absolute_reference;
use reftrust_crypto::{ContentHash, KeyPair};
use reftrust_policy::{PolicyError, PolicyStore, PropagationDirective, RepositoryResolver};
use reftrust_rsl::{EntryBody, EntryId, LatestEntryOptions, ReferenceStateLog, RslEntry, RslError};
use reftrust_storage::{ObjectId, Repository, StorageError, Tree};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PropagationError, PropagationResult};

/// Options for one propagation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagationOptions<'a> {
    /// Skip the pass entirely.
    pub skip: bool,
    /// Key signing propagation commits and entries.
    pub signer: Option<&'a KeyPair>,
}

/// What happened to one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// Upstream content matches what was last propagated, or there is
    /// nothing to propagate yet.
    Unchanged {
        /// Directive name.
        directive: String,
    },
    /// The upstream log has no unskipped entry for the upstream reference.
    NoUpstreamState {
        /// Directive name.
        directive: String,
    },
    /// New upstream content was recorded downstream.
    Propagated {
        /// Directive name.
        directive: String,
        /// Downstream tip after the pass.
        commit: ObjectId,
        /// Propagation entry appended to the log.
        entry_id: EntryId,
    },
}

impl PropagationOutcome {
    /// Directive the outcome is for.
    #[must_use]
    pub fn directive(&self) -> &str {
        match self {
            Self::Unchanged { directive }
            | Self::NoUpstreamState { directive }
            | Self::Propagated { directive, .. } => directive,
        }
    }
}

/// Result of a propagation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// The pass was skipped by request.
    pub skipped: bool,
    /// One outcome per directive, in policy order.
    pub outcomes: Vec<PropagationOutcome>,
}

impl PropagationReport {
    /// Directives that produced a new entry.
    #[must_use]
    pub fn propagated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, PropagationOutcome::Propagated { .. }))
            .count()
    }
}

/// Upstream content read for one directive.
struct Upstream {
    entry_id: EntryId,
    tree: Tree,
    repo: Repository,
}

async fn cancellable<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> PropagationResult<T>
where
    PropagationError: From<E>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(PropagationError::Cancelled),
        result = fut => result.map_err(PropagationError::from),
    }
}

/// Runs the directives of a repository's policy.
pub struct PropagationEngine {
    rsl: Arc<ReferenceStateLog>,
    policy: PolicyStore,
    resolver: Arc<dyn RepositoryResolver>,
}

impl std::fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("rsl", &self.rsl.name())
            .finish_non_exhaustive()
    }
}

impl PropagationEngine {
    /// Engine for the repository behind `policy`, reaching upstreams
    /// through `resolver`.
    #[must_use]
    pub fn new(policy: PolicyStore, resolver: Arc<dyn RepositoryResolver>) -> Self {
        Self {
            rsl: Arc::clone(policy.rsl()),
            policy,
            resolver,
        }
    }

    /// Run every directive of the latest policy once.
    ///
    /// Directives are handled in policy order. A directive whose upstream
    /// has no recorded state yields [`PropagationOutcome::NoUpstreamState`]
    /// and the pass moves on. Any other error stops the pass; directives
    /// handled before it keep their results.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError::Conflict`] if a downstream path was
    /// edited locally since its last propagation,
    /// [`PropagationError::Cancelled`] if `cancel` fires while reading an
    /// upstream (nothing is written for that directive), or the underlying
    /// policy, log or storage error.
    pub async fn run(
        &self,
        opts: PropagationOptions<'_>,
        cancel: &CancellationToken,
    ) -> PropagationResult<PropagationReport> {
        if opts.skip {
            debug!("Propagation skipped");
            return Ok(PropagationReport {
                skipped: true,
                outcomes: Vec::new(),
            });
        }
        let state = match self.policy.load_latest().await {
            Ok(state) => state,
            Err(PolicyError::NotFound(_)) => return Ok(PropagationReport::default()),
            Err(e) => return Err(e.into()),
        };

        let mut report = PropagationReport::default();
        for directive in state.directives() {
            let outcome = self.propagate(directive, opts.signer, cancel).await?;
            report.outcomes.push(outcome);
        }
        info!(
            directives = report.outcomes.len(),
            propagated = report.propagated(),
            "Propagation pass complete"
        );
        Ok(report)
    }

    async fn fetch_upstream(
        &self,
        directive: &PropagationDirective,
        cancel: &CancellationToken,
    ) -> PropagationResult<Option<Upstream>> {
        let log = cancellable(cancel, self.resolver.resolve(&directive.upstream_repository)).await?;
        let entry = match cancellable(
            cancel,
            log.get_latest_entry(&directive.upstream_reference, &LatestEntryOptions::unskipped()),
        )
        .await
        {
            Ok(entry) => entry,
            Err(PropagationError::Rsl(RslError::NotFound(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        let commit = entry.target_id().ok_or_else(|| PropagationError::UpstreamNotFound {
            directive: directive.name.clone(),
            reference: directive.upstream_reference.clone(),
        })?;
        let repo = log.repository().clone();
        let tree = cancellable(cancel, repo.tree_at(&commit))
            .await?
            .subtree(&directive.upstream_path);
        Ok(Some(Upstream {
            entry_id: entry.id,
            tree,
            repo,
        }))
    }

    /// Digest recorded by the latest unskipped propagation of `directive`
    /// into `ref_name`.
    async fn last_digest(
        &self,
        ref_name: &str,
        directive: &str,
    ) -> PropagationResult<Option<ContentHash>> {
        for entry in self.rsl.entries_for(ref_name).await?.into_iter().rev() {
            let EntryBody::Propagation {
                directive: name,
                content_digest,
                ..
            } = &entry.body
            else {
                continue;
            };
            if name == directive && !self.rsl.is_skipped(&entry.id).await? {
                return Ok(Some(*content_digest));
            }
        }
        Ok(None)
    }

    async fn propagate(
        &self,
        directive: &PropagationDirective,
        signer: Option<&KeyPair>,
        cancel: &CancellationToken,
    ) -> PropagationResult<PropagationOutcome> {
        let Some(upstream) = self.fetch_upstream(directive, cancel).await? else {
            warn!(
                directive = %directive.name,
                reference = %directive.upstream_reference,
                "Upstream reference has no recorded state"
            );
            return Ok(PropagationOutcome::NoUpstreamState {
                directive: directive.name.clone(),
            });
        };
        let digest = upstream.tree.id();
        let unchanged = PropagationOutcome::Unchanged {
            directive: directive.name.clone(),
        };
        let downstream_ref = absolute_reference(&directive.downstream_reference);
        let last_digest = self.last_digest(&downstream_ref, &directive.name).await?;
        if last_digest == Some(digest) {
            debug!(directive = %directive.name, "Upstream unchanged");
            return Ok(unchanged);
        }

        let repo = self.rsl.repository();
        let downstream_tree = repo.tree_at_ref(&downstream_ref).await?;
        let current = downstream_tree.subtree(&directive.downstream_path);
        if current.id() == digest {
            // Content already in place; record it without a new commit.
            let Some(tip) = repo.ref_tip(&downstream_ref).await? else {
                debug!(directive = %directive.name, "Upstream subtree is empty");
                return Ok(unchanged);
            };
            let entry = self
                .rsl
                .create_propagation_entry(
                    &downstream_ref,
                    tip,
                    &directive.upstream_repository,
                    upstream.entry_id,
                    &directive.name,
                    digest,
                    signer,
                )
                .await?;
            info!(directive = %directive.name, entry_id = %entry.id.short(), "Recorded existing propagated content");
            return Ok(PropagationOutcome::Propagated {
                directive: directive.name.clone(),
                commit: tip,
                entry_id: entry.id,
            });
        }

        let untouched = match last_digest {
            Some(previous) => current.id() == previous,
            None => current.is_empty(),
        };
        if !untouched {
            warn!(
                directive = %directive.name,
                downstream_ref = %downstream_ref,
                path = %directive.downstream_path,
                "Downstream path diverged from propagated content"
            );
            return Err(PropagationError::Conflict {
                directive: directive.name.clone(),
                downstream_reference: downstream_ref,
                downstream_path: directive.downstream_path.clone(),
            });
        }

        for blob in upstream.tree.entries.values() {
            let bytes = upstream.repo.objects().get_blob(blob).await?;
            repo.objects().put_blob(bytes).await?;
        }
        let tree = downstream_tree.with_subtree(&directive.downstream_path, &upstream.tree);
        let (commit, entry) = self
            .commit_propagation(directive, &downstream_ref, &tree, upstream.entry_id, digest, signer)
            .await?;
        info!(
            directive = %directive.name,
            commit = %commit.short(),
            entry_id = %entry.id.short(),
            "Propagated upstream content"
        );
        Ok(PropagationOutcome::Propagated {
            directive: directive.name.clone(),
            commit,
            entry_id: entry.id,
        })
    }

    /// Commit `tree` on `ref_name` and append the propagation entry, moving
    /// the reference back if the append fails.
    async fn commit_propagation(
        &self,
        directive: &PropagationDirective,
        ref_name: &str,
        tree: &Tree,
        upstream_entry_id: EntryId,
        digest: ContentHash,
        signer: Option<&KeyPair>,
    ) -> PropagationResult<(ObjectId, RslEntry)> {
        let repo = self.rsl.repository();
        let parent = repo.ref_tip(ref_name).await?;
        let message = format!("Propagate '{}' from {}", directive.name, directive.upstream_repository);
        let commit = repo.create_commit(parent, tree, &message, signer).await?;
        let refs = repo.refs();
        if !refs
            .compare_and_swap(ref_name, parent.as_ref(), Some(&commit))
            .await?
        {
            return Err(StorageError::RefConflict(ref_name.to_string()).into());
        }
        match self
            .rsl
            .create_propagation_entry(
                ref_name,
                commit,
                &directive.upstream_repository,
                upstream_entry_id,
                &directive.name,
                digest,
                signer,
            )
            .await
        {
            Ok(entry) => Ok((commit, entry)),
            Err(e) => {
                match refs
                    .compare_and_swap(ref_name, Some(&commit), parent.as_ref())
                    .await
                {
                    Ok(true) => warn!(ref_name, error = %e, "Rolled back propagation commit"),
                    Ok(false) => error!(ref_name, "Reference moved before rollback"),
                    Err(rollback) => error!(ref_name, error = %rollback, "Rollback failed"),
                }
                Err(e.into())
            },
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
