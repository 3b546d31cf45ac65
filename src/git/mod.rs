//! Repository - git repository operations.
//!
//! This module provides the [`Repository`] type for interacting with the two
//! on-disk repositories the engine works against (gecko and wpt), and
//! [`Worktree`] for scratch checkouts used during replay.
//!
//! All operations shell out to git via [`Cmd`](crate::shell_exec::Cmd); there
//! is no in-process object-database access. Refs may be updated concurrently
//! by git itself (fetches), so nothing here caches ref values.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use dunce::canonicalize;

use crate::shell_exec::Cmd;

mod error;

pub use error::GitError;

/// Handle to an on-disk git repository.
///
/// Cloning is cheap; clones operate on the same repository.
#[derive(Debug, Clone)]
pub struct Repository {
    /// Short name used as logging context ("gecko", "wpt").
    name: String,
    path: PathBuf,
}

impl Repository {
    /// Open the repository at `path`, verifying it is one.
    pub fn at(name: impl Into<String>, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let name = name.into();
        let path = path.into();
        let output = Cmd::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&path)
            .context(name.clone())
            .run()
            .context("Failed to execute: git rev-parse --git-dir")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} is not a git repository: {}", path.display(), stderr.trim());
        }
        let path = canonicalize(&path)
            .with_context(|| format!("Failed to resolve repository path {}", path.display()))?;
        Ok(Self { name, path })
    }

    /// Short display name of this repository, used as logging context.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a git command in this repository and return its stdout.
    ///
    /// Fails with the command's stderr (and stdout, some git commands print
    /// errors there) when the exit status is non-zero.
    pub fn run_command(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = self.run_command_output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let error_msg = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            bail!("{}", error_msg);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a git command and return whether it succeeded (exit code 0).
    ///
    /// For commands that use exit codes as boolean results, like
    /// `git merge-base --is-ancestor`.
    pub fn run_command_check(&self, args: &[&str]) -> anyhow::Result<bool> {
        Ok(self.run_command_output(args)?.status.success())
    }

    /// Run a git command and return the raw Output (for inspecting exit codes).
    fn run_command_output(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.path)
            .context(self.name.clone())
            .run()
            .with_context(|| format!("Failed to execute: git {}", args.join(" ")))
    }

    fn run_command_stdin(&self, args: &[&str], data: impl Into<Vec<u8>>) -> anyhow::Result<String> {
        let output = Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.path)
            .context(self.name.clone())
            .stdin(data)
            .run()
            .with_context(|| format!("Failed to execute: git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {}: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // =========================================================================
    // Revisions and history
    // =========================================================================

    /// Resolve a revision to a full object id.
    pub fn rev_parse(&self, rev: &str) -> anyhow::Result<String> {
        Ok(self
            .run_command(&["rev-parse", "--verify", &format!("{}^{{object}}", rev)])?
            .trim()
            .to_string())
    }

    /// Resolve a revision, returning `None` when it doesn't name an object.
    ///
    /// Used for abbreviated hashes quoted in backout messages, which may not
    /// exist locally at all.
    pub fn try_rev_parse(&self, rev: &str) -> Option<String> {
        let output = self
            .run_command_output(&["rev-parse", "--verify", "--quiet", &format!("{}^{{object}}", rev)])
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> anyhow::Result<bool> {
        self.run_command_check(&["merge-base", "--is-ancestor", ancestor, descendant])
    }

    pub fn merge_base(&self, a: &str, b: &str) -> anyhow::Result<String> {
        Ok(self.run_command(&["merge-base", a, b])?.trim().to_string())
    }

    /// Non-merge commits in `base..head`, parents first.
    ///
    /// With `path`, only commits touching that path are returned.
    pub fn rev_list(
        &self,
        base: &str,
        head: &str,
        path: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        let range = format!("{}..{}", base, head);
        let mut args = vec!["rev-list", "--reverse", "--max-parents=1", &range];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        Ok(self
            .run_command(&args)?
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Full commit message (subject and body) of `rev`.
    pub fn commit_message(&self, rev: &str) -> anyhow::Result<String> {
        self.run_command(&["show", "--no-patch", "--format=%B", rev])
    }

    /// `(author name, author email)` of `rev`.
    pub fn commit_author(&self, rev: &str) -> anyhow::Result<(String, String)> {
        let out = self.run_command(&["show", "--no-patch", "--format=%an%x00%ae", rev])?;
        let mut parts = out.trim_end().splitn(2, '\0');
        let name = parts.next().unwrap_or_default().to_string();
        let email = parts.next().unwrap_or_default().trim().to_string();
        Ok((name, email))
    }

    /// Paths touched by `rev` under `path` (empty when the commit doesn't
    /// change anything there).
    pub fn changed_paths(&self, rev: &str, path: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .run_command(&["diff-tree", "--no-commit-id", "--name-only", "-r", rev, "--", path])?
            .lines()
            .map(|line| line.to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Patch for `rev` restricted to `prefix`, with the prefix stripped from
    /// all paths. Binary changes are included so the patch is lossless.
    pub fn diff_stripped(&self, rev: &str, prefix: &str) -> anyhow::Result<String> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let relative = format!("--relative={}", dir);
        self.run_command(&[
            "diff",
            "--binary",
            &relative,
            &format!("{}^", rev),
            rev,
            "--",
            &dir,
        ])
    }

    // =========================================================================
    // Refs and objects
    // =========================================================================

    /// Resolve a ref, returning `None` when it doesn't exist.
    pub fn read_ref(&self, name: &str) -> anyhow::Result<Option<String>> {
        let output = self.run_command_output(&["rev-parse", "--verify", "--quiet", name])?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn update_ref(&self, name: &str, target: &str) -> anyhow::Result<()> {
        self.run_command(&["update-ref", name, target])?;
        Ok(())
    }

    pub fn delete_ref(&self, name: &str) -> anyhow::Result<()> {
        self.run_command(&["update-ref", "-d", name])?;
        Ok(())
    }

    /// `(refname, object id)` pairs for all refs under `prefix`.
    pub fn for_each_ref(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let out = self.run_command(&[
            "for-each-ref",
            "--format=%(refname) %(objectname)",
            prefix,
        ])?;
        let mut refs = Vec::new();
        for line in out.lines() {
            let (name, oid) = line
                .rsplit_once(' ')
                .ok_or_else(|| GitError::ParseError(format!("for-each-ref line {:?}", line)))?;
            refs.push((name.to_string(), oid.to_string()));
        }
        Ok(refs)
    }

    /// Store `data` as a blob in the object database and return its id.
    pub fn hash_object(&self, data: &str) -> anyhow::Result<String> {
        Ok(self
            .run_command_stdin(&["hash-object", "-w", "--stdin"], data.as_bytes().to_vec())?
            .trim()
            .to_string())
    }

    /// Read a blob's content.
    pub fn cat_blob(&self, oid: &str) -> anyhow::Result<String> {
        self.run_command(&["cat-file", "blob", oid])
    }

    // =========================================================================
    // Branches and remotes
    // =========================================================================

    pub fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        Ok(self.read_ref(&format!("refs/heads/{}", branch))?.is_some())
    }

    /// Create or reset a local branch to `target` without touching any
    /// checkout. `git branch -f` refuses checked-out branches; update-ref
    /// doesn't, and replay resets the worktree right after.
    pub fn set_branch(&self, branch: &str, target: &str) -> anyhow::Result<()> {
        self.update_ref(&format!("refs/heads/{}", branch), target)
    }

    pub fn delete_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.delete_ref(&format!("refs/heads/{}", branch))
    }

    /// The configured upstream of a local branch (`origin/foo`), if any.
    pub fn branch_upstream(&self, branch: &str) -> anyhow::Result<Option<String>> {
        let out = self.run_command(&[
            "for-each-ref",
            "--format=%(upstream:short)",
            &format!("refs/heads/{}", branch),
        ])?;
        let upstream = out.trim();
        Ok(if upstream.is_empty() {
            None
        } else {
            Some(upstream.to_string())
        })
    }

    pub fn set_branch_upstream(
        &self,
        branch: &str,
        remote: &str,
        remote_branch: &str,
    ) -> anyhow::Result<()> {
        self.run_command(&["config", &format!("branch.{}.remote", branch), remote])?;
        self.run_command(&[
            "config",
            &format!("branch.{}.merge", branch),
            &format!("refs/heads/{}", remote_branch),
        ])?;
        Ok(())
    }

    pub fn fetch(&self, remote: &str) -> anyhow::Result<()> {
        self.run_command(&["fetch", "--quiet", remote])?;
        Ok(())
    }

    /// Force-push `local_branch` to `remote_branch` on `remote`.
    pub fn push(&self, remote: &str, local_branch: &str, remote_branch: &str) -> anyhow::Result<()> {
        let refspec = format!("refs/heads/{}:refs/heads/{}", local_branch, remote_branch);
        self.run_command(&["push", "--quiet", "--force", remote, &refspec])?;
        Ok(())
    }

    pub fn push_delete(&self, remote: &str, remote_branch: &str) -> anyhow::Result<()> {
        self.run_command(&["push", "--quiet", remote, "--delete", remote_branch])?;
        Ok(())
    }

    // =========================================================================
    // Worktrees
    // =========================================================================

    /// Get a scratch checkout of `branch` at `path`, creating it if needed.
    ///
    /// The returned worktree is NOT clean; callers reset it before use.
    pub fn worktree(&self, branch: &str, path: &Path) -> anyhow::Result<Worktree> {
        if !path.exists() {
            std::fs::create_dir_all(path.parent().unwrap_or(path))
                .with_context(|| format!("Failed to create {}", path.display()))?;
            self.run_command(&[
                "worktree",
                "add",
                "--force",
                &path.to_string_lossy(),
                branch,
            ])?;
        }
        Ok(Worktree {
            name: format!("{}:{}", self.name, branch),
            path: path.to_path_buf(),
        })
    }

    /// Remove a scratch worktree, discarding its state.
    pub fn remove_worktree(&self, path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            self.run_command(&["worktree", "remove", "--force", &path.to_string_lossy()])?;
        }
        Ok(())
    }
}

/// A scratch checkout used to materialize replayed commits.
#[derive(Debug)]
pub struct Worktree {
    name: String,
    path: PathBuf,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.path)
            .context(self.name.clone())
            .run()
            .with_context(|| format!("Failed to execute: git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {}: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `reset --hard; clean -fdx` - the state any replay starts from.
    pub fn reset_clean(&self) -> anyhow::Result<()> {
        self.git(&["reset", "--hard", "--quiet"])?;
        self.git(&["clean", "-fdxq"])?;
        Ok(())
    }

    pub fn head_sha(&self) -> anyhow::Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn is_dirty(&self) -> anyhow::Result<bool> {
        Ok(!self.git(&["status", "--porcelain"])?.trim().is_empty())
    }

    /// Apply a patch to both the index and the working tree.
    pub fn apply_patch(&self, rev: &str, patch: &str) -> Result<(), GitError> {
        let output = Cmd::new("git")
            .args(["apply", "--index", "--whitespace=nowarn", "-"])
            .current_dir(&self.path)
            .context(self.name.clone())
            .stdin(patch.as_bytes().to_vec())
            .run()
            .map_err(|e| GitError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(GitError::PatchDoesNotApply {
                rev: rev.to_string(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Whether the index contains any change against HEAD.
    pub fn has_staged_changes(&self) -> anyhow::Result<bool> {
        let output = Cmd::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(&self.path)
            .context(self.name.clone())
            .run()
            .context("Failed to execute: git diff --cached --quiet")?;
        Ok(!output.status.success())
    }

    /// Commit the staged changes with the given message and author line.
    pub fn commit(&self, message: &str, author: &str) -> anyhow::Result<String> {
        let output = Cmd::new("git")
            .args(["commit", "--quiet", "--no-verify", "--author", author, "-F", "-"])
            .current_dir(&self.path)
            .context(self.name.clone())
            .stdin(message.as_bytes().to_vec())
            .run()
            .context("Failed to execute: git commit")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            bail!("git commit: {}{}", stderr.trim(), stdout.trim());
        }
        self.head_sha()
    }
}
