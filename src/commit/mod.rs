//! Commit model for the two sides of the sync.
//!
//! [`GeckoCommit`] wraps a commit on the integration repository and knows how
//! to read the bug id, backout targets, and reviewer annotations out of the
//! gecko commit-message conventions. [`WptCommit`] wraps a replayed commit on
//! the upstream repository and exposes the `key: value` metadata block the
//! replay engine appends to the message.

use anyhow::Context;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::git::Repository;

mod range;

pub use range::CommitRange;

/// Bug prefix at the start of a gecko commit summary: `Bug 1234 - ...`.
static BUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:bug|b=)[\s]*#?(\d+)").unwrap());

/// Backout summary lines: `Backed out changeset abc...`, `Back out ...`,
/// `Backout of ...`, `Revert ...` is NOT a backout in gecko convention.
static BACKOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:back(?:ed|ing)?[\s-]?out|backout)\b").unwrap());

/// Changeset hashes quoted in a backout message.
static CHANGESET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([0-9a-f]{12,40})\b").unwrap());

/// Bug references anywhere in a message body, for backout attribution.
static BODY_BUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:bug|b=)[\s]*#?(\d+)").unwrap());

/// Reviewer annotations in a summary line: `r=foo`, `r?foo,bar`, `a=baz`.
static REVIEWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\b[ra][=?]([\w.,/\-]+)").unwrap());

/// Metadata line inside the trailing block: `gecko-commit: abc123`.
static METADATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-Z0-9_-]+): (.*)$").unwrap());

/// Parse the `key: value` metadata block from the final paragraph of a commit
/// message. Returns an empty map when the final paragraph isn't one.
pub fn get_metadata(msg: &str) -> IndexMap<String, String> {
    let last_paragraph = msg
        .trim_end()
        .rsplit("\n\n")
        .next()
        .unwrap_or_default();
    let mut metadata = IndexMap::new();
    for line in last_paragraph.lines() {
        match METADATA_RE.captures(line) {
            Some(caps) => {
                metadata.insert(caps[1].to_string(), caps[2].to_string());
            }
            None => {
                // A non-metadata line means this paragraph is prose
                return IndexMap::new();
            }
        }
    }
    metadata
}

/// Append a metadata block to a message, after a blank line.
pub fn add_metadata(msg: &str, metadata: &IndexMap<String, String>) -> String {
    if metadata.is_empty() {
        return msg.trim_end().to_string();
    }
    let mut out = msg.trim_end().to_string();
    out.push_str("\n\n");
    for (key, value) in metadata {
        out.push_str(&format!("{}: {}\n", key, value));
    }
    out.trim_end().to_string()
}

/// A commit on the gecko integration repository.
///
/// The message is read once at construction; everything else is derived from
/// it. The commit object itself is immutable so this never goes stale.
#[derive(Debug, Clone)]
pub struct GeckoCommit {
    repo: Repository,
    sha: String,
    msg: String,
}

impl GeckoCommit {
    pub fn new(repo: &Repository, rev: &str) -> anyhow::Result<Self> {
        let sha = repo.rev_parse(rev)?;
        let msg = repo
            .commit_message(&sha)
            .with_context(|| format!("Failed to read commit {}", sha))?;
        Ok(Self {
            repo: repo.clone(),
            sha,
            msg,
        })
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// The stable identifier recorded in replayed-commit metadata.
    pub fn canonical_rev(&self) -> &str {
        &self.sha
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn summary(&self) -> &str {
        self.msg.lines().next().unwrap_or_default()
    }

    pub fn metadata(&self) -> IndexMap<String, String> {
        get_metadata(&self.msg)
    }

    /// Bug id from the summary line, if the commit follows the
    /// `Bug N - ...` convention.
    pub fn bug(&self) -> Option<u64> {
        BUG_RE
            .captures(self.summary())
            .and_then(|caps| caps[1].parse().ok())
    }

    pub fn author_email(&self) -> anyhow::Result<String> {
        Ok(self.repo.commit_author(&self.sha)?.1)
    }

    /// `Name <email>` author line, for replaying with the original author.
    pub fn author_line(&self) -> anyhow::Result<String> {
        let (name, email) = self.repo.commit_author(&self.sha)?;
        Ok(format!("{} <{}>", name, email))
    }

    pub fn is_backout(&self) -> bool {
        BACKOUT_RE.is_match(self.summary())
    }

    /// Full shas of the commits this backout reverts, with the bugs they
    /// mention. Hashes that don't resolve locally are dropped; bug ids come
    /// from the backout message itself (gecko backouts quote them).
    pub fn backed_out_commits(&self) -> anyhow::Result<(Vec<GeckoCommit>, Vec<u64>)> {
        if !self.is_backout() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut commits = Vec::new();
        for caps in CHANGESET_RE.captures_iter(&self.msg) {
            if let Some(sha) = self.repo.try_rev_parse(&caps[1]) {
                commits.push(GeckoCommit::new(&self.repo, &sha)?);
            } else {
                log::warn!("Backout {} quotes unknown changeset {}", self.sha, &caps[1]);
            }
        }
        let mut bugs: Vec<u64> = Vec::new();
        for caps in BODY_BUG_RE.captures_iter(&self.msg) {
            if let Ok(bug) = caps[1].parse::<u64>()
                && !bugs.contains(&bug)
            {
                bugs.push(bug);
            }
        }
        Ok((commits, bugs))
    }

    /// Whether the commit changes nothing under `path`.
    pub fn is_empty(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.repo.changed_paths(&self.sha, path)?.is_empty())
    }

    /// Patch restricted to `prefix` with the prefix stripped.
    pub fn stripped_patch(&self, prefix: &str) -> anyhow::Result<String> {
        self.repo.diff_stripped(&self.sha, prefix)
    }
}

impl PartialEq for GeckoCommit {
    fn eq(&self, other: &Self) -> bool {
        self.sha == other.sha
    }
}

impl Eq for GeckoCommit {}

/// A replayed commit on the upstream repository.
#[derive(Debug, Clone)]
pub struct WptCommit {
    sha: String,
    msg: String,
}

impl WptCommit {
    pub fn new(repo: &Repository, rev: &str) -> anyhow::Result<Self> {
        let sha = repo.rev_parse(rev)?;
        let msg = repo
            .commit_message(&sha)
            .with_context(|| format!("Failed to read commit {}", sha))?;
        Ok(Self { sha, msg })
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn summary(&self) -> &str {
        self.msg.lines().next().unwrap_or_default()
    }

    pub fn metadata(&self) -> IndexMap<String, String> {
        get_metadata(&self.msg)
    }

    /// The gecko commit this replay originated from, when recorded.
    pub fn gecko_commit(&self) -> Option<String> {
        self.metadata().get("gecko-commit").cloned()
    }
}

/// Required trailer keys on a replayed upstream commit.
pub const UPSTREAM_METADATA_KEYS: [&str; 3] =
    ["gecko-commit", "gecko-integration-branch", "bugzilla-url"];

/// Whether `message` carries the full upstream replay metadata block.
pub fn has_upstream_metadata(message: &str) -> bool {
    let metadata = get_metadata(message);
    UPSTREAM_METADATA_KEYS
        .iter()
        .all(|key| metadata.contains_key(*key))
}

/// Rewrite a gecko commit message for the upstream repository.
///
/// Strips the `Bug N -` prefix from the summary, removes reviewer
/// annotations, drops any existing metadata block, and returns the metadata
/// extracted along the way (`bugzilla-url`, `gecko-reviewers`). The caller
/// appends the combined metadata with [`add_metadata`].
pub fn commit_message_filter(
    msg: &str,
    bugzilla_base_url: &str,
) -> (String, IndexMap<String, String>) {
    let mut metadata = IndexMap::new();
    let mut msg = msg.trim_end().to_string();

    if let Some(caps) = BUG_RE.captures(&msg) {
        let bug: Option<u64> = caps[1].parse().ok();
        let prefix_len = caps.get(0).unwrap().end();
        // Strip the bug prefix together with any separator punctuation
        let rest = msg[prefix_len..]
            .trim_start_matches(|c: char| !(c.is_alphanumeric() || c == '[' || c == '('));
        msg = rest.to_string();
        if let Some(bug) = bug {
            metadata.insert(
                "bugzilla-url".to_string(),
                crate::bugzilla::bug_url(bugzilla_base_url, bug),
            );
        }
    }

    let reviewers: Vec<String> = REVIEWER_RE
        .captures_iter(&msg)
        .flat_map(|caps| {
            caps[1]
                .split(',')
                .map(|r| r.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|r| !r.is_empty())
        .collect();
    if !reviewers.is_empty() {
        metadata.insert("gecko-reviewers".to_string(), reviewers.join(", "));
    }
    msg = REVIEWER_RE.replace_all(&msg, "").to_string();

    // Drop any pre-existing metadata block so ours is the only one
    if !get_metadata(&msg).is_empty()
        && let Some(idx) = msg.trim_end().rfind("\n\n")
    {
        msg.truncate(idx);
    }

    let mut lines = msg.lines();
    let summary = lines
        .next()
        .unwrap_or_default()
        .trim_end_matches(|c: char| "!#$%&(*+,-/:;<=>@[\\^_`{|~".contains(c))
        .trim_end()
        .to_string();
    let description = lines.collect::<Vec<_>>().join("\n");
    let rewritten = if description.trim().is_empty() {
        summary
    } else {
        format!("{}\n{}", summary, description)
    };

    (rewritten, metadata)
}
