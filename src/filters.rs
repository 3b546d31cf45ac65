//! Commit classification and backout cancellation.
//!
//! A push range contains more than tracked test changes: backouts, replays
//! created by the downstream sync, and landing merges all show up under the
//! tracked path. Everything here decides which commits an upstream sync
//! should care about.

use std::collections::HashSet;

use crate::commit::GeckoCommit;

/// Classification of a commit found in a push range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitClass {
    /// A change to the tracked subtree that should be replayed upstream
    TrackedChange,
    /// A backout of at least one tracked commit
    Backout,
    /// A commit created by the downstream (PR -> gecko) sync
    DownstreamReplay,
    /// A landing-sync merge of upstream into gecko
    Landing,
    /// Explicitly marked to skip, or otherwise irrelevant
    Skipped,
}

/// Classify a commit for the grouping pass.
pub fn classify(commit: &GeckoCommit, tracked_path: &str) -> anyhow::Result<CommitClass> {
    let metadata = commit.metadata();
    if metadata.contains_key("wptsync-skip") {
        return Ok(CommitClass::Skipped);
    }
    if metadata.contains_key("wpt-pr") {
        return Ok(CommitClass::DownstreamReplay);
    }
    if metadata.get("wpt-type").map(String::as_str) == Some("landing") {
        return Ok(CommitClass::Landing);
    }
    if commit.is_backout() {
        if tracked_backouts(commit, tracked_path)?.is_empty() {
            // Reverts nothing we mirror
            return Ok(CommitClass::Skipped);
        }
        return Ok(CommitClass::Backout);
    }
    Ok(CommitClass::TrackedChange)
}

/// The backed-out commits of `commit` that touch the tracked subtree.
pub fn tracked_backouts(
    commit: &GeckoCommit,
    tracked_path: &str,
) -> anyhow::Result<Vec<GeckoCommit>> {
    let (backed_out, _) = commit.backed_out_commits()?;
    let mut tracked = Vec::new();
    for backed_out_commit in backed_out {
        if !backed_out_commit.is_empty(tracked_path)? {
            tracked.push(backed_out_commit);
        }
    }
    Ok(tracked)
}

/// One entry in a cancellation pass: a sha, plus the shas it backs out when
/// the commit is a backout.
#[derive(Debug, Clone)]
pub struct CancelEntry {
    pub sha: String,
    pub backs_out: Option<Vec<String>>,
}

/// The backout-pair cancellation law.
///
/// Iterate in order maintaining a surviving set; non-backouts join it; a
/// backout whose targets are all present removes them and is dropped, any
/// other backout survives. Returns the surviving shas.
pub fn cancel_complete_backouts(entries: &[CancelEntry]) -> HashSet<String> {
    let mut remaining: HashSet<String> = HashSet::new();
    for entry in entries {
        if let Some(backs_out) = &entry.backs_out {
            let backed_out: HashSet<String> = backs_out.iter().cloned().collect();
            if backed_out.is_subset(&remaining) {
                for sha in &backed_out {
                    remaining.remove(sha);
                }
                continue;
            }
        }
        remaining.insert(entry.sha.clone());
    }
    remaining
}

/// Remove commit/backout pairs that cancel out within `commits`, preserving
/// order of the survivors.
pub fn remove_complete_backouts(
    commits: Vec<GeckoCommit>,
    tracked_path: &str,
) -> anyhow::Result<Vec<GeckoCommit>> {
    let mut entries = Vec::with_capacity(commits.len());
    for commit in &commits {
        let backs_out = if commit.is_backout() {
            Some(
                tracked_backouts(commit, tracked_path)?
                    .iter()
                    .map(|c| c.sha().to_string())
                    .collect(),
            )
        } else {
            None
        };
        entries.push(CancelEntry {
            sha: commit.sha().to_string(),
            backs_out,
        });
    }
    let remaining = cancel_complete_backouts(&entries);
    Ok(commits
        .into_iter()
        .filter(|c| remaining.contains(c.sha()))
        .collect())
}

/// Filter deciding which commits belong to one sync's gecko range.
pub trait CommitFilter {
    /// Per-commit admission test; may record state for later commits.
    fn filter_commit(&mut self, commit: &GeckoCommit) -> anyhow::Result<bool>;

    /// Whole-range pass applied after per-commit filtering.
    fn filter_range(&self, commits: Vec<GeckoCommit>) -> anyhow::Result<Vec<GeckoCommit>> {
        Ok(commits)
    }
}

/// Admits the commits belonging to one bug's sync, including backouts of
/// commits it previously admitted.
pub struct BackoutCommitFilter {
    bug: u64,
    tracked_path: String,
    seen: HashSet<String>,
}

impl BackoutCommitFilter {
    pub fn new(bug: u64, tracked_path: impl Into<String>) -> Self {
        Self {
            bug,
            tracked_path: tracked_path.into(),
            seen: HashSet::new(),
        }
    }
}

impl CommitFilter for BackoutCommitFilter {
    fn filter_commit(&mut self, commit: &GeckoCommit) -> anyhow::Result<bool> {
        let metadata = commit.metadata();
        if metadata.contains_key("wptsync-skip") || metadata.contains_key("wpt-pr") {
            return Ok(false);
        }
        if commit.is_backout() {
            let (backed_out, _) = commit.backed_out_commits()?;
            for backed_out_commit in &backed_out {
                if self.seen.contains(backed_out_commit.sha()) {
                    return Ok(true);
                }
            }
        }
        if commit.bug() == Some(self.bug) {
            if commit.is_empty(&self.tracked_path)? {
                return Ok(false);
            }
            self.seen.insert(commit.sha().to_string());
            return Ok(true);
        }
        Ok(false)
    }

    fn filter_range(&self, commits: Vec<GeckoCommit>) -> anyhow::Result<Vec<GeckoCommit>> {
        remove_complete_backouts(commits, &self.tracked_path)
    }
}
