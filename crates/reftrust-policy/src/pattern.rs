//! Rule patterns.
//!
//! A pattern is `git:<reference glob>` or `file:<path glob>`; a bare
//! pattern is a reference glob. Short reference globs are expanded the way
//! branch names are (`main` becomes `refs/heads/main`). `*` never crosses a
//! `/`; use `**` for that.

use globset::{GlobBuilder, GlobMatcher};
use reftrust_core::absolute_reference;

use crate::error::{PolicyError, PolicyResult};

const GIT_PREFIX: &str = "git:";
const FILE_PREFIX: &str = "file:";

/// What a pattern matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Reference names.
    Git,
    /// Paths inside the tree.
    File,
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    kind: PatternKind,
    matcher: GlobMatcher,
}

impl Pattern {
    /// Compile `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidMetadata`] for an empty or malformed glob.
    pub fn parse(raw: &str) -> PolicyResult<Self> {
        let (kind, glob) = if let Some(rest) = raw.strip_prefix(FILE_PREFIX) {
            (PatternKind::File, rest.trim_start_matches('/').to_string())
        } else {
            let rest = raw.strip_prefix(GIT_PREFIX).unwrap_or(raw);
            (PatternKind::Git, absolute_reference(rest))
        };
        if glob.is_empty() {
            return Err(PolicyError::InvalidMetadata(format!("empty pattern '{raw}'")));
        }
        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .build()
            .map_err(|e| PolicyError::InvalidMetadata(format!("pattern '{raw}': {e}")))?
            .compile_matcher();
        Ok(Self {
            raw: raw.to_string(),
            kind,
            matcher,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Pattern kind.
    #[must_use]
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Whether this reference pattern matches `ref_name`.
    #[must_use]
    pub fn matches_ref(&self, ref_name: &str) -> bool {
        self.kind == PatternKind::Git && self.matcher.is_match(absolute_reference(ref_name))
    }

    /// Whether this file pattern matches `path`.
    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        self.kind == PatternKind::File && self.matcher.is_match(path.trim_start_matches('/'))
    }
}

/// Patterns belonging to one rule.
#[derive(Debug, Clone)]
pub(crate) struct PatternSet(Vec<Pattern>);

impl PatternSet {
    pub(crate) fn compile(raw: &[String]) -> PolicyResult<Self> {
        raw.iter()
            .map(|p| Pattern::parse(p))
            .collect::<PolicyResult<Vec<_>>>()
            .map(Self)
    }

    pub(crate) fn matches_ref(&self, ref_name: &str) -> bool {
        self.0.iter().any(|p| p.matches_ref(ref_name))
    }

    pub(crate) fn matches_path(&self, path: &str) -> bool {
        self.0.iter().any(|p| p.matches_path(path))
    }

    pub(crate) fn has_file_patterns(&self) -> bool {
        self.0.iter().any(|p| p.kind() == PatternKind::File)
    }
}
