//! Lazy commit ranges.

use crate::git::{GitError, Repository};

/// A `(base, head, path)` triple over a repository.
///
/// Enumeration yields the commits reachable from `head` but not `base`,
/// parents first. The head is a ref name, re-read on every enumeration; the
/// underlying ref may advance, so a range is a view, not a snapshot.
#[derive(Debug, Clone)]
pub struct CommitRange {
    repo: Repository,
    base: String,
    head_ref: String,
    path: Option<String>,
}

impl CommitRange {
    pub fn new(
        repo: Repository,
        base: impl Into<String>,
        head_ref: impl Into<String>,
        path: Option<String>,
    ) -> Self {
        Self {
            repo,
            base: base.into(),
            head_ref: head_ref.into(),
            path,
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn head_ref(&self) -> &str {
        &self.head_ref
    }

    /// Current head commit, failing when the ref has gone missing.
    pub fn head_sha(&self) -> anyhow::Result<String> {
        self.repo
            .read_ref(&self.head_ref)?
            .ok_or_else(|| GitError::RefNotFound(self.head_ref.clone()).into())
    }

    /// Shas in `base..head`, parents first, restricted to the range's path.
    pub fn shas(&self) -> anyhow::Result<Vec<String>> {
        let head = self.head_sha()?;
        self.repo.rev_list(&self.base, &head, self.path.as_deref())
    }
}
