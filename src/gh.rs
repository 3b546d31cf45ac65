//! Pull-request host client.
//!
//! The engine only needs the narrow surface in [`PrHost`]; the production
//! implementation [`GhCli`] drives the GitHub REST API through the `gh`
//! CLI, which owns authentication and rate-limit handling. Tests substitute
//! an in-memory host.

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::shell_exec::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PullState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub state: PullState,
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
    pub head_sha: String,
    pub title: String,
    pub body: Option<String>,
    /// GitHub computes this lazily; `None` means not yet known
    pub mergeable: Option<bool>,
}

/// One CI check run on a PR's head commit.
#[derive(Debug, Clone)]
pub struct CheckRun {
    /// `queued`, `in_progress`, or `completed`
    pub status: String,
    /// `success`, `neutral`, `failure`, ... - only set once completed
    pub conclusion: Option<String>,
    /// Whether the check gates merging
    pub required: bool,
    pub head_sha: String,
    pub url: Option<String>,
}

/// The calls the sync engine makes against the PR host.
pub trait PrHost {
    fn get_pull(&self, pr_id: u64) -> anyhow::Result<PullRequest>;
    fn pull_state(&self, pr_id: u64) -> anyhow::Result<PullState>;
    fn is_mergeable(&self, pr_id: u64) -> anyhow::Result<bool>;
    fn is_approved(&self, pr_id: u64) -> anyhow::Result<bool>;
    /// Check runs for the PR's current head, keyed by check name.
    fn get_check_runs(&self, pr_id: u64) -> anyhow::Result<IndexMap<String, CheckRun>>;
    fn create_pull(&self, title: &str, body: &str, base: &str, head: &str)
    -> anyhow::Result<u64>;
    fn close_pull(&self, pr_id: u64) -> anyhow::Result<()>;
    fn reopen_pull(&self, pr_id: u64) -> anyhow::Result<()>;
    /// Merge the PR and return the merge commit sha.
    fn merge_pull(&self, pr_id: u64) -> anyhow::Result<String>;
    /// The merge commit sha when the PR has merged, else `None`.
    fn merge_sha(&self, pr_id: u64) -> anyhow::Result<Option<String>>;
    /// Set a commit status on the PR's head.
    fn set_status(
        &self,
        pr_id: u64,
        state: &str,
        target_url: &str,
        description: &str,
        context: &str,
    ) -> anyhow::Result<()>;
    /// Whether a branch exists on the upstream repository.
    fn branch_exists(&self, branch: &str) -> anyhow::Result<bool>;
    /// Commit messages of the PR, in order.
    fn get_commit_messages(&self, pr_id: u64) -> anyhow::Result<Vec<String>>;
    fn pr_url(&self, pr_id: u64) -> String;
}

/// [`PrHost`] backed by the `gh` CLI.
pub struct GhCli {
    /// `owner/name`
    repo: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    merge_commit_sha: Option<String>,
    head: GhRef,
    title: String,
    body: Option<String>,
    mergeable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhCheckRuns {
    check_runs: Vec<GhCheckRun>,
}

#[derive(Debug, Deserialize)]
struct GhCheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
    head_sha: String,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhReview {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GhPullCommit {
    commit: GhCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GhMergeResult {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhCreated {
    number: u64,
}

impl GhCli {
    pub fn new(repo: impl Into<String>) -> Self {
        Self { repo: repo.into() }
    }

    fn api(&self, args: &[&str]) -> anyhow::Result<Vec<u8>> {
        let output = Cmd::new("gh")
            .arg("api")
            .args(args.iter().copied())
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .run()
            .context("Failed to execute gh")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh api {}: {}", args.first().copied().unwrap_or(""), stderr.trim());
        }
        Ok(output.stdout)
    }

    fn api_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> anyhow::Result<T> {
        let stdout = self.api(args)?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Failed to parse gh api {} output", args.first().copied().unwrap_or("")))
    }

    fn pulls_path(&self, pr_id: u64) -> String {
        format!("repos/{}/pulls/{}", self.repo, pr_id)
    }

    fn pull(&self, pr_id: u64) -> anyhow::Result<GhPull> {
        self.api_json(&[&self.pulls_path(pr_id)])
    }
}

impl PrHost for GhCli {
    fn get_pull(&self, pr_id: u64) -> anyhow::Result<PullRequest> {
        let pull = self.pull(pr_id)?;
        let state = pull
            .state
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown PR state {:?}", pull.state))?;
        Ok(PullRequest {
            number: pull.number,
            state,
            merged: pull.merged,
            merge_commit_sha: pull.merge_commit_sha,
            head_sha: pull.head.sha,
            title: pull.title,
            body: pull.body,
            mergeable: pull.mergeable,
        })
    }

    fn pull_state(&self, pr_id: u64) -> anyhow::Result<PullState> {
        Ok(self.get_pull(pr_id)?.state)
    }

    fn is_mergeable(&self, pr_id: u64) -> anyhow::Result<bool> {
        Ok(self.get_pull(pr_id)?.mergeable.unwrap_or(false))
    }

    fn is_approved(&self, pr_id: u64) -> anyhow::Result<bool> {
        let reviews: Vec<GhReview> =
            self.api_json(&[&format!("{}/reviews", self.pulls_path(pr_id))])?;
        Ok(reviews.iter().any(|r| r.state == "APPROVED"))
    }

    fn get_check_runs(&self, pr_id: u64) -> anyhow::Result<IndexMap<String, CheckRun>> {
        let head_sha = self.get_pull(pr_id)?.head_sha;
        let runs: GhCheckRuns = self.api_json(&[&format!(
            "repos/{}/commits/{}/check-runs",
            self.repo, head_sha
        )])?;
        let mut checks = IndexMap::new();
        for run in runs.check_runs {
            checks.insert(
                run.name,
                CheckRun {
                    status: run.status,
                    conclusion: run.conclusion,
                    // Branch protection isn't queryable with the bot's
                    // permissions, so treat every check as gating
                    required: true,
                    head_sha: run.head_sha,
                    url: run.html_url,
                },
            );
        }
        Ok(checks)
    }

    fn create_pull(
        &self,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> anyhow::Result<u64> {
        let created: GhCreated = self.api_json(&[
            &format!("repos/{}/pulls", self.repo),
            "-X",
            "POST",
            "-f",
            &format!("title={}", title),
            "-f",
            &format!("body={}", body),
            "-f",
            &format!("base={}", base),
            "-f",
            &format!("head={}", head),
        ])?;
        Ok(created.number)
    }

    fn close_pull(&self, pr_id: u64) -> anyhow::Result<()> {
        self.api(&[&self.pulls_path(pr_id), "-X", "PATCH", "-f", "state=closed"])?;
        Ok(())
    }

    fn reopen_pull(&self, pr_id: u64) -> anyhow::Result<()> {
        self.api(&[&self.pulls_path(pr_id), "-X", "PATCH", "-f", "state=open"])?;
        Ok(())
    }

    fn merge_pull(&self, pr_id: u64) -> anyhow::Result<String> {
        let result: GhMergeResult = self.api_json(&[
            &format!("{}/merge", self.pulls_path(pr_id)),
            "-X",
            "PUT",
            "-f",
            "merge_method=rebase",
        ])?;
        Ok(result.sha)
    }

    fn merge_sha(&self, pr_id: u64) -> anyhow::Result<Option<String>> {
        let pull = self.get_pull(pr_id)?;
        Ok(if pull.merged { pull.merge_commit_sha } else { None })
    }

    fn set_status(
        &self,
        pr_id: u64,
        state: &str,
        target_url: &str,
        description: &str,
        context: &str,
    ) -> anyhow::Result<()> {
        let head_sha = self.get_pull(pr_id)?.head_sha;
        self.api(&[
            &format!("repos/{}/statuses/{}", self.repo, head_sha),
            "-X",
            "POST",
            "-f",
            &format!("state={}", state),
            "-f",
            &format!("target_url={}", target_url),
            "-f",
            &format!("description={}", description),
            "-f",
            &format!("context={}", context),
        ])?;
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        let output = Cmd::new("gh")
            .arg("api")
            .arg(format!("repos/{}/branches/{}", self.repo, branch))
            .env("GH_PROMPT_DISABLED", "1")
            .run()
            .context("Failed to execute gh")?;
        Ok(output.status.success())
    }

    fn get_commit_messages(&self, pr_id: u64) -> anyhow::Result<Vec<String>> {
        let commits: Vec<GhPullCommit> =
            self.api_json(&[&format!("{}/commits", self.pulls_path(pr_id))])?;
        Ok(commits.into_iter().map(|c| c.commit.message).collect())
    }

    fn pr_url(&self, pr_id: u64) -> String {
        format!("https://github.com/{}/pull/{}", self.repo, pr_id)
    }
}
