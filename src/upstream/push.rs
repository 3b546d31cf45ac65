//! Grouping pushed commits into syncs, and the command entry points built on
//! top of it.
//!
//! A push event delivers a new head for the integration branch. The work
//! here turns `prev..head` into two sets - syncs to create and syncs to
//! advance - then materializes each, reconciles its PR, and finally walks
//! the open syncs attempting to land whatever has reached central.

use indexmap::IndexMap;

use crate::commit::GeckoCommit;
use crate::env::Environment;
use crate::errors::SyncError;
use crate::filters::{CommitClass, classify, remove_complete_backouts};
use crate::gh::CheckRun;
use crate::lock::ProcessLock;
use crate::store::{PrCheck, PrStatus, Status, SyncStore};
use crate::upstream::UpstreamSync;

/// Endpoints of a future sync's gecko range. The base is the parent of the
/// first commit; the head accretes as more commits for the same bug arrive
/// in one push.
#[derive(Debug, Clone)]
pub struct Endpoints {
    first: GeckoCommit,
    last: Option<GeckoCommit>,
}

impl Endpoints {
    pub fn new(first: GeckoCommit) -> Self {
        Self { first, last: None }
    }

    pub fn base(&self, env: &Environment) -> anyhow::Result<String> {
        env.gecko.rev_parse(&format!("{}^", self.first.sha()))
    }

    pub fn head(&self) -> &GeckoCommit {
        self.last.as_ref().unwrap_or(&self.first)
    }

    pub fn set_head(&mut self, commit: GeckoCommit) {
        self.last = Some(commit);
    }
}

/// Syncs to create, bucketed by bug. `anonymous` entries have no usable bug;
/// one is filed before the sync is created.
#[derive(Debug, Default)]
pub struct CreateSyncs {
    pub by_bug: IndexMap<u64, Endpoints>,
    pub anonymous: Vec<Endpoints>,
}

impl CreateSyncs {
    fn merge(&mut self, other: CreateSyncs) {
        self.by_bug.extend(other.by_bug);
        self.anonymous.extend(other.anonymous);
    }

    pub fn is_empty(&self) -> bool {
        self.by_bug.is_empty() && self.anonymous.is_empty()
    }
}

/// Existing syncs to advance, keyed by bug: `(sync, new gecko head)`.
pub type UpdateSyncs = IndexMap<u64, (UpstreamSync, GeckoCommit)>;

/// Relevant commits in `prev..head`: touching the tracked subtree, with
/// skip-marked, downstream-replay, and untracked-backout commits removed and
/// backout pairs cancelled.
fn wpt_commits_for_range(
    env: &Environment,
    prev: &str,
    head: &str,
) -> anyhow::Result<Vec<GeckoCommit>> {
    log::info!("Getting commits in range {}..{}", prev, head);
    let tracked_path = &env.config.gecko.tracked_path;
    let mut commits = Vec::new();
    for sha in env.gecko.rev_list(prev, head, Some(tracked_path))? {
        let commit = GeckoCommit::new(&env.gecko, &sha)?;
        if classify(&commit, tracked_path)? != CommitClass::Skipped {
            commits.push(commit);
        }
    }
    Ok(commits)
}

/// Updates implied by one backout commit.
///
/// Each backed-out commit that an open sync already upstreamed queues the
/// backout as an update on that sync and leaves the residual set. Residual
/// hashes mean the backout covers something new: queue a create under the
/// first quoted bug with no open sync, else anonymously.
fn updates_for_backout(
    env: &Environment,
    store: &SyncStore,
    commit: &GeckoCommit,
) -> anyhow::Result<(CreateSyncs, UpdateSyncs)> {
    let (backed_out, bugs) = commit.backed_out_commits()?;
    let mut residual: Vec<String> = backed_out.iter().map(|c| c.sha().to_string()).collect();

    let mut create = CreateSyncs::default();
    let mut update = UpdateSyncs::new();

    for backed_out_commit in &backed_out {
        let Some(bug) = backed_out_commit.bug() else {
            continue;
        };
        let Some(sync) = UpstreamSync::latest_for_bug(store, bug)? else {
            continue;
        };
        let sync_shas: Vec<String> = sync
            .gecko_commits(env)?
            .iter()
            .map(|c| c.sha().to_string())
            .collect();
        if sync_shas.iter().any(|sha| sha == commit.sha()) {
            // This backout was already processed
            return Ok((CreateSyncs::default(), UpdateSyncs::new()));
        }
        let upstreamed: Vec<String> = sync
            .upstreamed_gecko_commits(env)?
            .iter()
            .map(|c| c.sha().to_string())
            .collect();
        if upstreamed.iter().any(|sha| sha == backed_out_commit.sha()) {
            residual.retain(|sha| sha != backed_out_commit.sha());
            update.insert(bug, (sync, commit.clone()));
        }
    }

    if !residual.is_empty() {
        // The backout covers something other than known open syncs, so a
        // sync is created especially for it
        let mut backout_bug = None;
        for bug in &bugs {
            if !update.contains_key(bug)
                && UpstreamSync::for_bug(store, *bug, &[Status::Open, Status::Incomplete])?
                    .is_empty()
            {
                backout_bug = Some(*bug);
                break;
            }
        }
        match backout_bug {
            None => create.anonymous.push(Endpoints::new(commit.clone())),
            Some(bug) => {
                create.by_bug.insert(bug, Endpoints::new(commit.clone()));
            }
        }
    }

    Ok((create, update))
}

/// The grouping algorithm: decide which syncs a push creates and which it
/// advances. Returns `None` when the push contains nothing relevant.
pub fn updated_syncs_for_push(
    env: &Environment,
    store: &SyncStore,
    prev: &str,
    head: &str,
) -> anyhow::Result<Option<(CreateSyncs, UpdateSyncs)>> {
    let commits = wpt_commits_for_range(env, prev, head)?;
    if commits.is_empty() {
        log::info!("No new commits affecting wpt found");
        return Ok(None);
    }
    log::info!("Got {} commits since the last sync point", commits.len());

    let tracked_path = env.config.gecko.tracked_path.clone();
    let commits = remove_complete_backouts(commits, &tracked_path)?;
    if commits.is_empty() {
        log::info!("No commits remain after removing backout pairs");
        return Ok(None);
    }

    // Reverse lookup commit -> owning sync, rebuilt from the open and
    // incomplete syncs' ranges
    let mut claimed: std::collections::HashSet<String> = std::collections::HashSet::new();
    for status in [Status::Open, Status::Incomplete] {
        for sync in UpstreamSync::load_by_status(store, status)? {
            for commit in sync.gecko_commits(env)? {
                claimed.insert(commit.sha().to_string());
            }
        }
    }

    let mut create = CreateSyncs::default();
    let mut update = UpdateSyncs::new();

    for commit in commits {
        if claimed.contains(commit.sha()) {
            // Already processed, e.g. by a manual invocation
            continue;
        }
        match classify(&commit, &tracked_path)? {
            CommitClass::Backout => {
                let (backout_create, backout_update) = updates_for_backout(env, store, &commit)?;
                create.merge(backout_create);
                update.extend(backout_update);
            }
            CommitClass::DownstreamReplay | CommitClass::Landing | CommitClass::Skipped => {}
            CommitClass::TrackedChange => {
                let Some(bug) = commit.bug() else {
                    create.anonymous.push(Endpoints::new(commit));
                    continue;
                };
                if let Some((_, queued_head)) = update.get_mut(&bug) {
                    *queued_head = commit;
                    continue;
                }
                match UpstreamSync::latest_for_bug(store, bug)? {
                    Some(sync) => {
                        let in_sync = sync
                            .gecko_commits(env)?
                            .iter()
                            .any(|c| c.sha() == commit.sha());
                        if !in_sync {
                            update.insert(bug, (sync, commit));
                        } else if sync.pr().is_none() {
                            // Known commit but no PR yet: re-run the
                            // reconciler at the current head
                            let head =
                                GeckoCommit::new(&env.gecko, &store.gecko_head(sync.id())?)?;
                            update.insert(bug, (sync, head));
                        }
                    }
                    None => match create.by_bug.get_mut(&bug) {
                        Some(endpoints) => endpoints.set_head(commit),
                        None => {
                            create.by_bug.insert(bug, Endpoints::new(commit));
                        }
                    },
                }
            }
        }
    }

    Ok(Some((create, update)))
}

/// Materialize the create buckets as new syncs. Anonymous buckets get a
/// fresh bug filed first.
pub fn create_syncs(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    create: CreateSyncs,
) -> anyhow::Result<Vec<UpstreamSync>> {
    let mut syncs = Vec::new();
    for (bug, endpoints) in &create.by_bug {
        syncs.push(UpstreamSync::new(
            lock,
            env,
            store,
            *bug,
            &endpoints.base(env)?,
            endpoints.head().sha(),
        )?);
    }
    for endpoints in &create.anonymous {
        let head = endpoints.head();
        let bug = env.bz.file_bug(
            &format!(
                "Upstream commit {} to web-platform-tests",
                head.canonical_rev()
            ),
            "",
            "Testing",
            "web-platform-tests",
            super::ORPHAN_WHITEBOARD,
        )?;
        syncs.push(UpstreamSync::new(
            lock,
            env,
            store,
            bug,
            &endpoints.base(env)?,
            head.sha(),
        )?);
    }
    Ok(syncs)
}

/// Advance the gecko heads of the syncs queued for update.
pub fn update_sync_heads(
    lock: &ProcessLock,
    update: UpdateSyncs,
) -> anyhow::Result<Vec<UpstreamSync>> {
    let mut syncs = Vec::new();
    for (bug, (mut sync, commit)) in update {
        if !matches!(sync.status(), Status::Open | Status::Incomplete) {
            return Err(SyncError::Invariant(format!(
                "Tried to modify a closed sync for bug {} with commit {}",
                bug,
                commit.canonical_rev()
            ))
            .into());
        }
        sync.for_mut(lock).set_gecko_head(commit.sha())?;
        syncs.push(sync);
    }
    Ok(syncs)
}

/// The wpt commit the landing sync last merged into gecko, when the peer has
/// recorded one. Used as the fallback replay base after a conflict.
fn landing_sync_point(env: &Environment) -> anyhow::Result<Option<String>> {
    env.wpt.read_ref("refs/syncs/landed")
}

/// Bring one modified sync up to date: status, replayed commits, PR.
fn update_modified_sync(
    lock: &ProcessLock,
    env: &Environment,
    sync: &mut UpstreamSync,
) -> Result<(), SyncError> {
    let gecko_commits = sync.gecko_commits(env)?;
    let mut sync_mut = sync.for_mut(lock);

    if gecko_commits.is_empty() {
        // Everything was backed out, presumably. The wpt side stays
        // untouched so the PR can reopen if something relands.
        log::info!("Sync has no commits, so marking as incomplete");
        sync_mut.set_status(Status::Incomplete)?;
        if sync_mut.pr().is_none() {
            log::info!("Sync was already fully applied upstream, not creating a PR");
            return Ok(());
        }
    } else {
        sync_mut.set_status(Status::Open)?;
        if let Err(e) = sync_mut.update_wpt_commits(env) {
            match e {
                SyncError::Conflict(_) | SyncError::Abort(_) if sync_mut.pr().is_none() => {
                    // A conflict against the default base and no PR yet: try
                    // recreating the commits on top of the current landing
                    // sync point so a PR exists and the failure is visible
                    log::info!(
                        "Applying to {} failed; retrying with the current sync point",
                        env.config.wpt.base_ref
                    );
                    let fallback_base = match landing_sync_point(env)? {
                        Some(point) => point,
                        None => env.config.wpt.base_ref.clone(),
                    };
                    sync_mut.set_wpt_base(env, &fallback_base)?;
                    if let Err(retry_err) = sync_mut.update_wpt_commits(env) {
                        sync_mut.set_wpt_base(env, &env.config.wpt.base_ref)?;
                        let bug = sync_mut.bug();
                        if let Err(bz_err) = env.bz.comment_with_needinfo(
                            bug,
                            "Failed to create upstream wpt PR due to merge conflicts. \
                             This requires fixup from a wpt sync admin.",
                            &env.config.gecko.needinfo,
                        ) {
                            log::warn!("Failed to update bug {}: {}", bug, bz_err);
                        }
                        return Err(retry_err);
                    }
                }
                e => return Err(e),
            }
        }
    }

    sync_mut.update_github(env)?;
    Ok(())
}

/// Run the reconciler over every created and updated sync.
///
/// Each sync is its own failure domain: errors land in the sync's sticky
/// `error` field and the batch continues. Only invariant violations escape.
/// With `raise_on_error`, the first failure propagates instead (operator
/// debugging paths).
pub fn update_sync_prs(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    create: CreateSyncs,
    update: UpdateSyncs,
    raise_on_error: bool,
) -> anyhow::Result<(Vec<UpstreamSync>, Vec<(UpstreamSync, SyncError)>)> {
    let mut to_push = create_syncs(lock, env, store, create)?;
    to_push.extend(update_sync_heads(lock, update)?);

    let mut pushed = Vec::new();
    let mut failed = Vec::new();

    for mut sync in to_push {
        match update_modified_sync(lock, env, &mut sync) {
            Ok(()) => {
                sync.for_mut(lock).set_error(None)?;
                pushed.push(sync);
            }
            Err(e) if e.is_invariant() => return Err(e.into()),
            Err(e) => {
                log::error!("Updating sync {} failed: {}", sync.id(), e);
                sync.for_mut(lock).set_error(Some(e.to_string()))?;
                if raise_on_error {
                    return Err(e.into());
                }
                failed.push((sync, e));
            }
        }
    }

    Ok((pushed, failed))
}

/// Attempt to land each of `syncs`, returning those that merged.
pub fn try_land_syncs(
    lock: &ProcessLock,
    env: &Environment,
    syncs: Vec<UpstreamSync>,
) -> anyhow::Result<Vec<UpstreamSync>> {
    let mut landed = Vec::new();
    for mut sync in syncs {
        if sync.for_mut(lock).try_land_pr(env)? {
            landed.push(sync);
        }
    }
    Ok(landed)
}

/// Outcome of a push-processing pass.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub pushed: Vec<UpstreamSync>,
    pub landed: Vec<UpstreamSync>,
    pub failed: Vec<(UpstreamSync, SyncError)>,
}

/// Process an advance of the integration branch to `rev`.
///
/// Computes the range from the stored last sync point (or `base_rev` when
/// given), creates/advances syncs, attempts landings, and finally moves the
/// sync point forward.
pub fn gecko_push(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    rev: &str,
    base_rev: Option<&str>,
    raise_on_error: bool,
) -> anyhow::Result<PushOutcome> {
    let rev = env.gecko.rev_parse(rev)?;
    let repo_name = &env.config.gecko.integration_name;
    let last_sync_point = store.last_sync_point(repo_name)?;

    if base_rev.is_none()
        && let Some(last) = &last_sync_point
        && env.gecko.is_ancestor(&rev, last)?
    {
        log::info!("Last sync point moved past commit");
        return Ok(PushOutcome::default());
    }

    let prev = match (base_rev, &last_sync_point) {
        (Some(base), _) => env.gecko.rev_parse(base)?,
        (None, Some(last)) => last.clone(),
        // First run: nothing before the canonical branch can need upstreaming
        (None, None) => env.gecko.merge_base(&env.config.gecko.refs.central, &rev)?,
    };

    let mut outcome = PushOutcome::default();

    if let Some((create, update)) = updated_syncs_for_push(env, store, &prev, &rev)? {
        let (pushed, failed) = update_sync_prs(lock, env, store, create, update, raise_on_error)?;
        outcome.pushed = pushed;
        outcome.failed = failed;
    }

    let landable: Vec<UpstreamSync> = UpstreamSync::load_by_status(store, Status::Open)?
        .into_iter()
        .filter(|sync| sync.error().is_none())
        .collect();
    outcome.landed = try_land_syncs(lock, env, landable)?;

    let advance = match &last_sync_point {
        Some(last) => !env.gecko.is_ancestor(&rev, last)?,
        None => true,
    };
    if advance {
        store.set_last_sync_point(repo_name, &rev)?;
    }

    Ok(outcome)
}

/// Re-run the reconciler for a single sync (operator paths; errors raise).
pub fn update_sync(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    sync: UpstreamSync,
) -> anyhow::Result<PushOutcome> {
    if sync.status().is_terminal() {
        log::info!("Nothing to do for sync with status {}", sync.status());
        return Ok(PushOutcome::default());
    }

    let head = GeckoCommit::new(&env.gecko, &store.gecko_head(sync.id())?)?;
    let mut update = UpdateSyncs::new();
    update.insert(sync.bug(), (sync, head));

    let (pushed, failed) =
        update_sync_prs(lock, env, store, CreateSyncs::default(), update, true)?;

    let landed = try_land_syncs(lock, env, pushed.clone())?;
    Ok(PushOutcome {
        pushed,
        landed,
        failed,
    })
}

// =========================================================================
// CI checks
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Pending,
    Failure,
}

/// Whether all required check runs pass.
fn commit_checks_pass(checks: &IndexMap<String, CheckRun>) -> bool {
    checks.values().all(|check| {
        !check.required
            || (check.status == "completed"
                && matches!(check.conclusion.as_deref(), Some("success") | Some("neutral")))
    })
}

/// Whether all check runs are complete.
fn commit_checks_complete(checks: &IndexMap<String, CheckRun>) -> bool {
    checks.values().all(|check| check.status == "completed")
}

pub fn get_check_status(
    env: &Environment,
    pr_id: u64,
) -> anyhow::Result<(CheckStatus, IndexMap<String, CheckRun>)> {
    let checks = env.gh.get_check_runs(pr_id)?;
    let status = if commit_checks_pass(&checks) {
        CheckStatus::Success
    } else if !commit_checks_complete(&checks) {
        CheckStatus::Pending
    } else {
        CheckStatus::Failure
    };
    Ok((status, checks))
}

/// Handle a CI notification for a sync's PR.
///
/// De-duplicates on `(state, head sha)` so one commit gets one notification;
/// on success lands if gecko has landed, else tells the bug the PR will
/// merge later; on failure comments the failing check list and needinfos the
/// commit author. Returns whether this call landed the PR.
pub fn commit_check_changed(
    lock: &ProcessLock,
    env: &Environment,
    sync: &mut UpstreamSync,
) -> anyhow::Result<bool> {
    if sync.status() != Status::Open {
        return Ok(false);
    }
    let Some(pr) = sync.pr() else {
        log::error!("Sync {} has no PR", sync.id());
        return Ok(false);
    };

    let (check_status, checks) = get_check_status(env, pr)?;
    if checks.is_empty() {
        log::error!("No checks found for pr {}", pr);
        return Ok(false);
    }

    // Record the overall status and commit so each commit notifies once
    let this_check = PrCheck {
        state: check_status.to_string(),
        head_sha: checks
            .values()
            .next()
            .map(|check| check.head_sha.clone())
            .unwrap_or_default(),
    };
    let last_check = sync.last_pr_check().cloned();
    let mut sync_mut = sync.for_mut(lock);
    sync_mut.set_last_pr_check(Some(this_check.clone()))?;

    let mut landed = false;
    match check_status {
        CheckStatus::Success => {
            sync_mut.set_error(None)?;
            if sync_mut.gecko_landed(env)? {
                landed = sync_mut.try_land_pr(env)?;
            } else if last_check.as_ref() != Some(&this_check) {
                env.bz.comment(
                    sync_mut.bug(),
                    "Upstream web-platform-tests status checks passed, \
                     PR will merge once commit reaches central.",
                )?;
            }
        }
        CheckStatus::Failure if last_check.as_ref() != Some(&this_check) => {
            let mut details = vec![format!("Github PR {}", env.gh.pr_url(pr))];
            for (name, check) in &checks {
                if !matches!(check.conclusion.as_deref(), Some("success") | Some("neutral")) {
                    details.push(format!(
                        "* {} ({})",
                        name,
                        check.url.as_deref().unwrap_or("no url")
                    ));
                }
            }
            let msg = format!(
                "Can't merge web-platform-tests PR due to failing upstream checks:\n{}",
                details.join("\n")
            );
            let bug = sync_mut.bug();
            let author = sync_mut
                .gecko_commits(env)?
                .first()
                .map(|commit| commit.author_email())
                .transpose()?;
            let needinfo: Vec<String> = author.into_iter().collect();
            if let Err(e) = env.bz.comment_with_needinfo(bug, &msg, &needinfo) {
                // Needinfos fail when the commit email doesn't match a
                // bugzilla account; non-fatal but worth remembering
                log::warn!("Failed to update bug {}: {}", bug, e);
                sync_mut.set_error(Some("Checks failed".to_string()))?;
            }
        }
        CheckStatus::Failure | CheckStatus::Pending => {
            log::info!("Some upstream web-platform-tests status checks still pending.");
        }
    }
    Ok(landed)
}

// =========================================================================
// PR events
// =========================================================================

/// A PR state change reported by the host.
#[derive(Debug, Clone)]
pub enum PrEvent {
    Closed {
        merge_sha: Option<String>,
        base_sha: Option<String>,
        merged_by: Option<String>,
    },
    Reopened,
}

/// Handle a PR being closed, merged, or reopened out-of-band.
pub fn update_pr(
    lock: &ProcessLock,
    env: &Environment,
    sync: &mut UpstreamSync,
    event: PrEvent,
) -> anyhow::Result<()> {
    match event {
        PrEvent::Closed {
            merge_sha: None, ..
        } => {
            if sync.pr_status() != PrStatus::Closed {
                env.bz
                    .comment(sync.bug(), "Upstream PR was closed without merging")?;
                sync.for_mut(lock).set_pr_status(PrStatus::Closed)?;
            }
        }
        PrEvent::Closed {
            merge_sha: Some(merge_sha),
            base_sha,
            merged_by,
        } => {
            let mut sync_mut = sync.for_mut(lock);
            sync_mut.set_merge_sha(Some(merge_sha))?;
            if sync_mut.wpt_commits(env)?.is_empty()
                && let Some(base_sha) = base_sha
            {
                sync_mut.set_wpt_base(env, &base_sha)?;
            }
            if !sync_mut.status().is_terminal() {
                env.bz.comment(
                    sync_mut.bug(),
                    &format!(
                        "Upstream PR merged by {}",
                        merged_by.as_deref().unwrap_or(&env.config.github.user)
                    ),
                )?;
                sync_mut.finish(env, Status::WptMerged)?;
            } else if sync_mut.status() == Status::WptMerged {
                // The merge this sync performed has now been confirmed by
                // the host; nothing is left to track
                sync_mut.finish(env, Status::Complete)?;
            }
        }
        PrEvent::Reopened => {
            sync.for_mut(lock).set_pr_status(PrStatus::Open)?;
        }
    }
    Ok(())
}

/// Reconstruct a sync from a PR whose commits carry replay metadata.
///
/// Used when an operator points `pr` at a PR the store has no record of. The
/// gecko endpoints come from the commit trailers; the wpt side starts at the
/// configured base and converges on the next reconcile.
pub fn sync_from_pr(
    lock: &ProcessLock,
    env: &Environment,
    store: &SyncStore,
    pr_id: u64,
    body: &str,
) -> anyhow::Result<Option<UpstreamSync>> {
    if !crate::commit::has_upstream_metadata(body) {
        return Ok(None);
    }

    let mut gecko_commits: Vec<String> = Vec::new();
    let mut bug = None;
    let mut integration_branch: Option<String> = None;

    for message in env.gh.get_commit_messages(pr_id)? {
        if !crate::commit::has_upstream_metadata(&message) {
            break;
        }
        let metadata = crate::commit::get_metadata(&message);
        let rev = metadata
            .get("gecko-commit")
            .expect("checked by has_upstream_metadata");
        let Some(sha) = env.gecko.try_rev_parse(rev) else {
            log::error!("PR {} references unknown gecko commit {}", pr_id, rev);
            break;
        };
        gecko_commits.push(sha);

        let commit_bug = metadata
            .get("bugzilla-url")
            .and_then(|url| env.bz.id_from_url(url));
        match (bug, commit_bug) {
            (Some(b), Some(cb)) if b != cb => {
                log::error!("Got multiple bug numbers from PR {} commits", pr_id);
                break;
            }
            (None, Some(cb)) => bug = Some(cb),
            _ => {}
        }

        let commit_branch = metadata.get("gecko-integration-branch").cloned();
        match (&integration_branch, commit_branch) {
            (Some(b), Some(cb)) if *b != cb => {
                log::warn!("Got multiple integration branches from PR {} commits", pr_id);
            }
            (None, Some(cb)) => integration_branch = Some(cb),
            _ => {}
        }
    }

    if gecko_commits.is_empty() {
        return Ok(None);
    }
    let Some(bug) = bug else {
        log::error!("PR {} commits carry no bug", pr_id);
        return Ok(None);
    };

    let gecko_base = format!("{}^", gecko_commits[0]);
    let gecko_head = gecko_commits.last().expect("non-empty").clone();
    let mut sync = UpstreamSync::new(lock, env, store, bug, &gecko_base, &gecko_head)?;
    sync.for_mut(lock).set_pr(Some(pr_id))?;
    Ok(Some(sync))
}
