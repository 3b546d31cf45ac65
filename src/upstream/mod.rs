//! The per-bug upstream sync: state machine, replay engine, PR reconciler,
//! and landing.
//!
//! An [`UpstreamSync`] couples one originating bug with the gecko commits
//! written against it, the replayed commits on a side branch in the wpt
//! repository, and the pull request proposing those replays upstream.
//!
//! Reads go through `&UpstreamSync`. Every mutation needs a [`SyncMut`],
//! which can only be obtained while holding the process lock - so a write
//! without the lock fails to compile rather than racing a peer.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::commit::{CommitRange, GeckoCommit, WptCommit, add_metadata, commit_message_filter};
use crate::env::Environment;
use crate::errors::SyncError;
use crate::filters::{BackoutCommitFilter, CommitFilter};
use crate::git::{GitError, Worktree};
use crate::lock::ProcessLock;
use crate::store::{PrCheck, PrStatus, Status, SyncData, SyncId, SyncStore};

pub mod push;

/// Whiteboard tag applied to bugs the sync files itself.
pub const ORPHAN_WHITEBOARD: &str = "[wptsync upstream]";

/// A persistent sync record, loaded from the store.
#[derive(Debug, Clone)]
pub struct UpstreamSync {
    id: SyncId,
    data: SyncData,
    store: SyncStore,
}

impl UpstreamSync {
    /// Create a new sync for `bug` covering `gecko_base..gecko_head`.
    ///
    /// The side branch is created at the configured wpt base ref. Creation is
    /// a mutation of the store, so it requires the process lock.
    pub fn new(
        _lock: &ProcessLock,
        env: &Environment,
        store: &SyncStore,
        bug: u64,
        gecko_base: &str,
        gecko_head: &str,
    ) -> anyhow::Result<Self> {
        let seq = store.next_seq(bug)?;
        let id = SyncId {
            status: Status::Open,
            seq,
            bug,
        };
        let wpt_base = env.wpt.rev_parse(&env.config.wpt.base_ref)?;
        let data = SyncData {
            gecko_base: env.gecko.rev_parse(gecko_base)?,
            wpt_base: wpt_base.clone(),
            ..Default::default()
        };
        store.create(id, &data, &env.gecko.rev_parse(gecko_head)?)?;
        env.wpt.set_branch(&id.branch_name(), &wpt_base)?;
        log::info!("Created sync {} for bug {}", id, bug);
        Ok(Self {
            id,
            data,
            store: store.clone(),
        })
    }

    pub fn load(store: &SyncStore, id: SyncId) -> anyhow::Result<Self> {
        let data = store.read_data(id)?;
        Ok(Self {
            id,
            data,
            store: store.clone(),
        })
    }

    /// All syncs for `bug` in the given statuses.
    pub fn for_bug(
        store: &SyncStore,
        bug: u64,
        statuses: &[Status],
    ) -> anyhow::Result<Vec<Self>> {
        let mut syncs = Vec::new();
        for id in store.list(None, Some(bug))? {
            if statuses.contains(&id.status) {
                syncs.push(Self::load(store, id)?);
            }
        }
        Ok(syncs)
    }

    /// The single open-or-incomplete sync for `bug`.
    ///
    /// Two open syncs for one bug is illegal; if it happens anyway, log and
    /// pick the most recently created: max seq within `open`, else within
    /// `incomplete`.
    pub fn latest_for_bug(store: &SyncStore, bug: u64) -> anyhow::Result<Option<Self>> {
        let syncs = Self::for_bug(store, bug, &[Status::Open, Status::Incomplete])?;
        if syncs.len() > 1 {
            log::error!(
                "Lookup of upstream syncs for bug {} returned {} syncs",
                bug,
                syncs.len()
            );
        }
        for status in [Status::Open, Status::Incomplete] {
            if let Some(sync) = syncs
                .iter()
                .filter(|s| s.status() == status)
                .max_by_key(|s| s.seq())
            {
                return Ok(Some(sync.clone()));
            }
        }
        Ok(None)
    }

    pub fn load_by_status(store: &SyncStore, status: Status) -> anyhow::Result<Vec<Self>> {
        store
            .list(Some(status), None)?
            .into_iter()
            .map(|id| Self::load(store, id))
            .collect()
    }

    /// The sync owning `pr`, if any.
    pub fn for_pr(store: &SyncStore, pr_id: u64) -> anyhow::Result<Option<Self>> {
        for id in store.list(None, None)? {
            let sync = Self::load(store, id)?;
            if sync.pr() == Some(pr_id) {
                return Ok(Some(sync));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Read accessors
    // =========================================================================

    pub fn id(&self) -> SyncId {
        self.id
    }

    pub fn bug(&self) -> u64 {
        self.id.bug
    }

    pub fn seq(&self) -> u32 {
        self.id.seq
    }

    pub fn status(&self) -> Status {
        self.id.status
    }

    pub fn pr(&self) -> Option<u64> {
        self.data.pr
    }

    pub fn pr_status(&self) -> PrStatus {
        self.data.pr_status
    }

    pub fn merge_sha(&self) -> Option<&str> {
        self.data.merge_sha.as_deref()
    }

    pub fn remote_branch(&self) -> Option<&str> {
        self.data.remote_branch.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.data.error.as_deref()
    }

    pub fn last_pr_check(&self) -> Option<&PrCheck> {
        self.data.last_pr_check.as_ref()
    }

    /// Name of the side branch in the wpt repository.
    pub fn branch_name(&self) -> String {
        self.id.branch_name()
    }

    /// Range of gecko commits this sync covers, unfiltered.
    pub fn gecko_range(&self, env: &Environment) -> CommitRange {
        CommitRange::new(
            env.gecko.clone(),
            self.data.gecko_base.clone(),
            self.id.gecko_ref(),
            Some(env.config.gecko.tracked_path.clone()),
        )
    }

    /// Range of replayed commits on the side branch.
    pub fn wpt_range(&self, env: &Environment) -> CommitRange {
        CommitRange::new(
            env.wpt.clone(),
            self.data.wpt_base.clone(),
            format!("refs/heads/{}", self.branch_name()),
            None,
        )
    }

    /// The gecko commits belonging to this sync, after backout filtering.
    pub fn gecko_commits(&self, env: &Environment) -> anyhow::Result<Vec<GeckoCommit>> {
        let mut filter = BackoutCommitFilter::new(self.bug(), &env.config.gecko.tracked_path);
        let mut commits = Vec::new();
        for sha in self.gecko_range(env).shas()? {
            let commit = GeckoCommit::new(&env.gecko, &sha)?;
            if filter.filter_commit(&commit)? {
                commits.push(commit);
            }
        }
        filter.filter_range(commits)
    }

    pub fn wpt_commits(&self, env: &Environment) -> anyhow::Result<Vec<WptCommit>> {
        self.wpt_range(env)
            .shas()?
            .iter()
            .map(|sha| WptCommit::new(&env.wpt, sha))
            .collect()
    }

    /// The gecko commits already represented upstream, derived from the
    /// metadata carried by the replayed commits.
    pub fn upstreamed_gecko_commits(&self, env: &Environment) -> anyhow::Result<Vec<GeckoCommit>> {
        let mut commits = Vec::new();
        for wpt_commit in self.wpt_commits(env)? {
            let Some(rev) = wpt_commit.gecko_commit() else {
                continue;
            };
            match env.gecko.try_rev_parse(&rev) {
                Some(sha) => commits.push(GeckoCommit::new(&env.gecko, &sha)?),
                None => log::warn!(
                    "Upstream commit {} references unknown gecko commit {}",
                    wpt_commit.sha(),
                    rev
                ),
            }
        }
        Ok(commits)
    }

    /// Whether every gecko commit has reached the canonical branch.
    ///
    /// A partially-landed sync is treated as not landed; that state resolves
    /// itself as central advances.
    pub fn gecko_landed(&self, env: &Environment) -> anyhow::Result<bool> {
        let commits = self.gecko_commits(env)?;
        if commits.is_empty() {
            return Ok(false);
        }
        let mut landed = Vec::with_capacity(commits.len());
        for commit in &commits {
            landed.push(
                env.gecko
                    .is_ancestor(commit.sha(), &env.config.gecko.refs.central)?,
            );
        }
        if !landed.iter().all(|l| *l == landed[0]) {
            log::warn!(
                "Got some commits landed and some not for upstream sync {}",
                self.id
            );
            return Ok(false);
        }
        Ok(landed[0])
    }

    /// Whether the local side branch matches the remote one.
    pub fn push_required(&self, env: &Environment) -> anyhow::Result<bool> {
        let Some(remote_branch) = self.remote_branch() else {
            return Ok(true);
        };
        let remote_ref = format!(
            "refs/remotes/{}/{}",
            env.config.wpt.remote, remote_branch
        );
        let Some(remote_head) = env.wpt.read_ref(&remote_ref)? else {
            return Ok(true);
        };
        Ok(remote_head != self.wpt_range(env).head_sha()?)
    }

    /// Multi-line operator-facing description, for `detail`.
    pub fn output(&self, env: &Environment) -> anyhow::Result<String> {
        let mut lines = vec![
            format!("sync {}", self.id),
            format!("bug: {}", self.bug()),
            format!(
                "pr: {}",
                self.pr()
                    .map(|pr| env.gh.pr_url(pr))
                    .unwrap_or_else(|| "-".to_string())
            ),
            format!("pr-status: {}", self.pr_status()),
            format!("branch: {}", self.branch_name()),
        ];
        if let Some(remote_branch) = self.remote_branch() {
            lines.push(format!("remote-branch: {}", remote_branch));
        }
        if let Some(merge_sha) = self.merge_sha() {
            lines.push(format!("merge-sha: {}", merge_sha));
        }
        if let Some(error) = self.error() {
            lines.push(format!("error: {}", error.lines().next().unwrap_or_default()));
        }
        for commit in self.gecko_commits(env)? {
            lines.push(format!("  gecko {} {}", commit.sha(), commit.summary()));
        }
        for commit in self.wpt_commits(env)? {
            lines.push(format!("  wpt   {} {}", commit.sha(), commit.summary()));
        }
        Ok(lines.join("\n"))
    }

    /// Obtain the mutation capability. Requires the process lock; the
    /// returned handle is the only path to any write.
    pub fn for_mut<'a>(&'a mut self, _lock: &'a ProcessLock) -> SyncMut<'a> {
        SyncMut { sync: self }
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.store.write_data(self.id, &self.data)
    }
}

/// Write capability for one sync, bound to the process lock's lifetime.
pub struct SyncMut<'a> {
    sync: &'a mut UpstreamSync,
}

impl std::ops::Deref for SyncMut<'_> {
    type Target = UpstreamSync;

    fn deref(&self) -> &UpstreamSync {
        self.sync
    }
}

impl SyncMut<'_> {
    // =========================================================================
    // Field writes (each persists the data blob)
    // =========================================================================

    pub fn set_pr(&mut self, pr: Option<u64>) -> anyhow::Result<()> {
        self.sync.data.pr = pr;
        self.sync.persist()
    }

    pub fn set_pr_status(&mut self, pr_status: PrStatus) -> anyhow::Result<()> {
        self.sync.data.pr_status = pr_status;
        self.sync.persist()
    }

    pub fn set_merge_sha(&mut self, merge_sha: Option<String>) -> anyhow::Result<()> {
        self.sync.data.merge_sha = merge_sha;
        self.sync.persist()
    }

    pub fn set_remote_branch(&mut self, remote_branch: Option<String>) -> anyhow::Result<()> {
        if let Some(name) = &remote_branch {
            assert!(
                !name.starts_with("refs/"),
                "remote branch must be a short name"
            );
        }
        self.sync.data.remote_branch = remote_branch;
        self.sync.persist()
    }

    pub fn set_error(&mut self, error: Option<String>) -> anyhow::Result<()> {
        self.sync.data.error = error;
        self.sync.persist()
    }

    pub fn set_last_pr_check(&mut self, check: Option<PrCheck>) -> anyhow::Result<()> {
        self.sync.data.last_pr_check = check;
        self.sync.persist()
    }

    pub fn set_gecko_head(&mut self, sha: &str) -> anyhow::Result<()> {
        self.sync.store.set_gecko_head(self.sync.id, sha)
    }

    /// Move the base of the replay range; `rev` may be a ref.
    pub fn set_wpt_base(&mut self, env: &Environment, rev: &str) -> anyhow::Result<()> {
        self.sync.data.wpt_base = env.wpt.rev_parse(rev)?;
        self.sync.persist()
    }

    /// Transition the state machine. Setting the current status is a no-op;
    /// any transition outside the allowed set is an invariant violation.
    pub fn set_status(&mut self, new_status: Status) -> Result<(), SyncError> {
        let current = self.sync.id.status;
        if current == new_status {
            return Ok(());
        }
        if !current.can_transition_to(new_status) {
            return Err(SyncError::Invariant(format!(
                "Illegal status transition {} -> {} for sync {}",
                current, new_status, self.sync.id
            )));
        }
        log::info!("Sync {}: {} -> {}", self.sync.id, current, new_status);
        self.sync.id = self
            .sync
            .store
            .transition(self.sync.id, new_status)
            .map_err(SyncError::from)?;
        Ok(())
    }

    // =========================================================================
    // Replay engine
    // =========================================================================

    /// Make the side branch's commit list a replay of the sync's gecko
    /// commits. Returns `false` when nothing changed.
    pub fn update_wpt_commits(&mut self, env: &Environment) -> Result<bool, SyncError> {
        let gecko_commits = self.sync.gecko_commits(env)?;
        if gecko_commits.is_empty() {
            return Ok(false);
        }

        // Find the commits that were already upstreamed. Some gecko commits
        // may not produce an upstream commit if the patch has no effect, but
        // if the last previously-upstreamed commit is still present then all
        // earlier ones must match too.
        let upstreamed = self.sync.upstreamed_gecko_commits(env)?;
        let upstreamed_shas: HashSet<&str> = upstreamed.iter().map(|c| c.sha()).collect();
        let mut matching = gecko_commits.len();
        for commit in gecko_commits.iter().rev() {
            if upstreamed_shas.contains(commit.sha()) {
                break;
            }
            matching -= 1;
        }

        if matching == gecko_commits.len() && gecko_commits.len() == upstreamed.len() {
            return Ok(false);
        }

        let branch = self.sync.branch_name();
        if matching == 0 {
            env.wpt
                .set_branch(&branch, &self.sync.data.wpt_base)
                .map_err(SyncError::from)?;
        } else if matching < upstreamed.len() {
            let wpt_commits = self.sync.wpt_commits(env)?;
            env.wpt
                .set_branch(&branch, wpt_commits[matching - 1].sha())
                .map_err(SyncError::from)?;
        }

        let worktree = env
            .wpt
            .worktree(&branch, &env.config.work_dir(&branch))
            .map_err(SyncError::from)?;
        worktree.reset_clean().map_err(SyncError::from)?;

        for commit in &gecko_commits[matching..] {
            self.add_commit(env, &worktree, commit)?;
        }

        let replayed = self.sync.upstreamed_gecko_commits(env)?.len();
        let wpt_len = self.sync.wpt_commits(env)?.len();
        if wpt_len != replayed {
            return Err(SyncError::Invariant(format!(
                "Sync {}: {} wpt commits but {} carry gecko metadata",
                self.sync.id, wpt_len, replayed
            )));
        }

        Ok(true)
    }

    /// Replay one gecko commit onto the side branch.
    ///
    /// Returns the new wpt commit sha, or `None` when the commit has no net
    /// effect under the tracked path (dropped silently).
    fn add_commit(
        &mut self,
        env: &Environment,
        worktree: &Worktree,
        gecko_commit: &GeckoCommit,
    ) -> Result<Option<String>, SyncError> {
        let rev = gecko_commit.canonical_rev();

        // A leftover sidecar patch means a previous attempt already failed
        // here; re-applying would presumably fail again
        let patch_path = worktree.path().join(format!("{}.diff", rev));
        if patch_path.exists() {
            return Err(SyncError::Abort("Skipping due to existing patch".to_string()));
        }

        let tracked_path = &env.config.gecko.tracked_path;
        let patch = gecko_commit
            .stripped_patch(tracked_path)
            .map_err(SyncError::from)?;
        if patch.trim().is_empty() {
            return Ok(None);
        }

        let head = self.sync.store.gecko_head(self.sync.id).map_err(SyncError::from)?;
        let (msg, extracted) = commit_message_filter(gecko_commit.msg(), &env.config.bugzilla.url);
        let mut metadata = IndexMap::new();
        metadata.insert("gecko-commit".to_string(), rev.to_string());
        metadata.insert(
            "gecko-integration-branch".to_string(),
            env.gecko_repo_name(&head).map_err(SyncError::from)?,
        );
        metadata.extend(extracted);
        let msg = add_metadata(&msg, &metadata);

        if let Err(e) = worktree.apply_patch(rev, &patch) {
            if let GitError::PatchDoesNotApply { .. } = &e {
                // Keep the patch on disk for the admin who gets the needinfo
                if let Err(write_err) = std::fs::write(&patch_path, &patch) {
                    log::warn!("Failed to write {}: {}", patch_path.display(), write_err);
                }
            }
            return Err(e.into());
        }

        if !worktree.has_staged_changes().map_err(SyncError::from)? {
            log::info!("Commit {} is empty after path filtering, dropping", rev);
            return Ok(None);
        }

        let author = gecko_commit.author_line().map_err(SyncError::from)?;
        let sha = worktree.commit(&msg, &author).map_err(SyncError::from)?;
        log::info!("Replayed {} as {}", rev, sha);
        Ok(Some(sha))
    }

    // =========================================================================
    // PR reconciler
    // =========================================================================

    /// Reconcile the sync with the PR host.
    pub fn update_github(&mut self, env: &Environment) -> Result<(), SyncError> {
        let gecko_commits = self.sync.gecko_commits(env)?;

        if let Some(pr) = self.sync.pr() {
            let state = env.gh.pull_state(pr)?;
            if gecko_commits.is_empty() {
                // Everything was backed out. Close the PR but leave the
                // branch alone: GitHub only allows reopening a closed PR if
                // its head hasn't moved in the meantime, and a reland will
                // want exactly that.
                env.gh.close_pull(pr)?;
            } else if state == crate::gh::PullState::Closed {
                let pull = env.gh.get_pull(pr)?;
                if !pull.merged {
                    env.gh.reopen_pull(pr)?;
                } else {
                    // If all the local commits are represented upstream,
                    // everything is fine and the sync closes out. Otherwise
                    // someone merged from under us.
                    let upstreamed = self.sync.upstreamed_gecko_commits(env)?;
                    if upstreamed.len() == gecko_commits.len() {
                        if !self.sync.status().is_terminal() {
                            env.bz.comment(self.sync.bug(), "Upstream PR merged")?;
                        }
                        self.finish(env, Status::Complete)?;
                    } else {
                        self.set_error(Some(
                            "Upstream PR merged, but additional commits added after merge"
                                .to_string(),
                        ))?;
                    }
                    return Ok(());
                }
            }
        }

        if gecko_commits.is_empty() {
            return Ok(());
        }
        if self.sync.upstreamed_gecko_commits(env)?.is_empty() {
            return Ok(());
        }

        if self.sync.push_required(env)? {
            self.push_commits(env)?;
        }
        if self.sync.pr().is_none() {
            self.create_pr(env)?;
        }

        self.set_landed_status(env)?;
        Ok(())
    }

    /// The remote branch name for this sync, assigning one if needed.
    ///
    /// Prefers (in order): the stored name; an upstream already configured on
    /// the local branch; a fresh `gecko/<bug>[-<n>]` avoiding collisions in
    /// the remote's ref namespace.
    pub fn get_or_create_remote_branch(&mut self, env: &Environment) -> anyhow::Result<String> {
        if let Some(name) = self.sync.remote_branch() {
            return Ok(name.to_string());
        }

        let remote_prefix = format!("{}/", env.config.wpt.remote);
        if let Some(upstream) = env.wpt.branch_upstream(&self.sync.branch_name())?
            && let Some(name) = upstream.strip_prefix(&remote_prefix)
        {
            let name = name.to_string();
            self.set_remote_branch(Some(name.clone()))?;
            return Ok(name);
        }

        let initial = format!("gecko/{}", self.sync.bug());
        let mut name = initial.clone();
        let mut count = 0;
        while env
            .wpt
            .read_ref(&format!("refs/remotes/{}/{}", env.config.wpt.remote, name))?
            .is_some()
        {
            count += 1;
            name = format!("{}-{}", initial, count);
        }
        self.set_remote_branch(Some(name.clone()))?;
        Ok(name)
    }

    fn push_commits(&mut self, env: &Environment) -> Result<(), SyncError> {
        let remote_branch = self.get_or_create_remote_branch(env)?;
        log::info!(
            "Pushing commits from bug {} to branch {}",
            self.sync.bug(),
            remote_branch
        );
        let branch = self.sync.branch_name();
        env.wpt
            .push(&env.config.wpt.remote, &branch, &remote_branch)
            .map_err(SyncError::from)?;
        env.wpt
            .set_branch_upstream(&branch, &env.config.wpt.remote, &remote_branch)
            .map_err(SyncError::from)?;
        Ok(())
    }

    /// Open the PR for this sync, if it doesn't already have one.
    pub fn create_pr(&mut self, env: &Environment) -> anyhow::Result<u64> {
        if let Some(pr) = self.sync.pr() {
            return Ok(pr);
        }
        let remote_branch = self
            .sync
            .remote_branch()
            .ok_or_else(|| anyhow::anyhow!("create_pr called before push"))?
            .to_string();

        // The push just happened; give the host a moment to notice the branch
        let mut attempts = 0;
        while !env.gh.branch_exists(&remote_branch)? {
            attempts += 1;
            if attempts > 30 {
                anyhow::bail!("Branch {} never appeared upstream", remote_branch);
            }
            log::debug!("Waiting for branch {}", remote_branch);
            std::thread::sleep(std::time::Duration::from_secs(1));
        }

        let wpt_commits = self.sync.wpt_commits(env)?;
        let first = wpt_commits
            .first()
            .ok_or_else(|| anyhow::anyhow!("create_pr called with no wpt commits"))?;
        let summary = first.summary().to_string();
        let body = first
            .msg()
            .split_once('\n')
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default();

        let pr_id = env.gh.create_pull(
            &format!("[Gecko Bug {}] {}", self.sync.bug(), summary),
            &body,
            &env.config.pr_base_branch(),
            &remote_branch,
        )?;
        self.set_pr(Some(pr_id))?;
        env.bz.comment(
            self.sync.bug(),
            &format!(
                "Created web-platform-tests PR {} for changes under {}",
                env.gh.pr_url(pr_id),
                env.config.gecko.tracked_path
            ),
        )?;
        Ok(pr_id)
    }

    /// Set the landed-status check on the PR head. The check tells upstream
    /// reviewers whether the change has reached mozilla-central.
    pub fn set_landed_status(&mut self, env: &Environment) -> Result<(), SyncError> {
        let Some(pr) = self.sync.pr() else {
            return Ok(());
        };
        let landed = self.sync.gecko_landed(env)?;
        let state = if landed { "success" } else { "failure" };
        log::info!("Setting landed status to {}", state);
        env.gh.set_status(
            pr,
            state,
            &env.bz.bug_url(self.sync.bug()),
            "Landed on mozilla-central",
            "upstream/gecko",
        )?;
        Ok(())
    }

    // =========================================================================
    // Landing
    // =========================================================================

    /// Try to merge the PR. Returns `true` only when this call performed the
    /// merge; every abort path is `false`.
    pub fn try_land_pr(&mut self, env: &Environment) -> Result<bool, SyncError> {
        log::info!("Checking if sync for bug {} can land", self.sync.bug());
        if self.sync.status() != Status::Open {
            log::info!("Sync is {}", self.sync.status());
            return Ok(false);
        }
        if !self.sync.gecko_landed(env)? {
            log::info!("Commits are not yet landed in gecko");
            return Ok(false);
        }
        let Some(pr) = self.sync.pr() else {
            log::info!("No upstream PR created");
            return Ok(false);
        };

        self.set_landed_status(env)?;

        if let Some(merge_sha) = env.gh.merge_sha(pr)? {
            log::info!("PR already merged");
            self.set_merge_sha(Some(merge_sha))?;
            self.finish(env, Status::WptMerged)?;
            return Ok(false);
        }

        log::info!("Commits are landable; trying to land {}", pr);

        let (check_status, _checks) = push::get_check_status(env, pr)?;
        let msg = if !matches!(check_status, push::CheckStatus::Success | push::CheckStatus::Pending)
        {
            Some(format!(
                "Can't merge web-platform-tests PR due to failing upstream checks:\nGithub PR {}",
                env.gh.pr_url(pr)
            ))
        } else if !env.gh.is_mergeable(pr)? {
            Some("Can't merge web-platform-tests PR because it has merge conflicts".to_string())
        } else if !env.gh.is_approved(pr)? {
            // Approval is driven by the upstream pr-bot
            Some("Can't merge web-platform-tests PR because it is missing approval".to_string())
        } else {
            match env.gh.merge_pull(pr) {
                Ok(merge_sha) => {
                    self.set_merge_sha(Some(merge_sha))?;
                    self.finish(env, Status::WptMerged)?;
                    if let Err(e) = env.bz.comment(
                        self.sync.bug(),
                        &format!("Upstream PR merged by {}", env.config.github.user),
                    ) {
                        log::warn!("Failed to comment on bug {}: {}", self.sync.bug(), e);
                    }
                    return Ok(true);
                }
                Err(e) => Some(format!("Merging PR {} failed.\nMessage: {}", env.gh.pr_url(pr), e)),
            }
        };

        if let Some(msg) = msg {
            log::error!("{}", msg);
        }
        Ok(false)
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Validate and persist a transition; on entry to a terminal status the
    /// remote branch is deleted (best effort) and released.
    pub fn finish(&mut self, env: &Environment, status: Status) -> Result<(), SyncError> {
        self.set_status(status)?;
        if status.is_terminal()
            && let Some(remote_branch) = self.sync.remote_branch().map(String::from)
        {
            match env.wpt.push_delete(&env.config.wpt.remote, &remote_branch) {
                Ok(()) => self.set_remote_branch(None)?,
                Err(e) => log::warn!("Failed to delete remote branch {}: {}", remote_branch, e),
            }
        }
        Ok(())
    }
}
