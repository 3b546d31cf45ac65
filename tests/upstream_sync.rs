//! End-to-end scenarios for the upstream sync engine, run against real git
//! repositories with faked network services.

mod common;

use common::{AUTOLAND_REF, SyncFixture, TRACKED_PATH};

use rstest::rstest;
use wptsync::commit::get_metadata;
use wptsync::gh::PullState;
use wptsync::store::{PrStatus, Status};
use wptsync::upstream::UpstreamSync;
use wptsync::upstream::push::{self, PrEvent};

/// S1: one commit, one sync; the PR is created, then lands once the commit
/// reaches central.
#[test]
fn test_single_commit_creates_sync_and_lands() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let sha = fx.tracked_commit(1001, "dialog-focus");
    let outcome = push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    assert_eq!(outcome.pushed.len(), 1);
    assert!(outcome.landed.is_empty());

    let sync = UpstreamSync::latest_for_bug(&store, 1001).unwrap().unwrap();
    assert_eq!(sync.status(), Status::Open);
    assert_eq!(sync.bug(), 1001);

    // One replayed commit, linked back to the gecko commit
    let replays = fx.wpt_branch_commits(&sync.branch_name());
    assert_eq!(replays.len(), 1);
    let metadata = get_metadata(&fx.wpt_commit_message(&replays[0]));
    assert_eq!(metadata.get("gecko-commit").unwrap(), &sha);
    assert_eq!(metadata.get("gecko-integration-branch").unwrap(), "autoland");
    assert!(metadata.get("bugzilla-url").unwrap().contains("id=1001"));

    // PR with the rewritten title, announced on the bug
    let pr = fx.host.only_pr();
    assert_eq!(pr.title, "[Gecko Bug 1001] Add dialog-focus test");
    assert!(
        fx.bz
            .comments_for(1001)
            .iter()
            .any(|c| c.contains("Created web-platform-tests PR"))
    );
    // Not on central yet, so the landed check is failing
    let statuses = fx.host.state.lock().unwrap().statuses.clone();
    let (_, state, description, context) = statuses.last().unwrap();
    assert_eq!(state, "failure");
    assert_eq!(description, "Landed on mozilla-central");
    assert_eq!(context, "upstream/gecko");

    // Land on central, approve, and re-run: the PR merges
    fx.land_on_central(&sha);
    fx.host.approve(pr.number);
    let outcome = push::update_sync(&lock, &env, &store, sync).unwrap();
    assert_eq!(outcome.landed.len(), 1);

    let sync = UpstreamSync::latest_for_bug(&store, 1001).unwrap();
    assert!(sync.is_none(), "sync should have left open/incomplete");
    let mut sync = UpstreamSync::for_pr(&store, pr.number).unwrap().unwrap();
    assert_eq!(sync.status(), Status::WptMerged);
    assert!(sync.merge_sha().is_some());
    assert!(sync.remote_branch().is_none(), "released after merge");
    assert!(
        !fx.remote_branches().contains(&"gecko/1001".to_string()),
        "remote branch deleted after merge"
    );
    assert!(
        fx.bz
            .comments_for(1001)
            .iter()
            .any(|c| c.contains("Upstream PR merged by moz-wptsync-bot"))
    );

    // The host's closed+merged webhook completes the sync
    let merge_sha = sync.merge_sha().unwrap().to_string();
    push::update_pr(
        &lock,
        &env,
        &mut sync,
        PrEvent::Closed {
            merge_sha: Some(merge_sha),
            base_sha: None,
            merged_by: Some("wpt-pr-bot".to_string()),
        },
    )
    .unwrap();
    assert_eq!(sync.status(), Status::Complete);
}

/// S2: a commit and its backout in the same push cancel; no sync appears.
/// Sheriffs write the backout note with or without the bug reference; both
/// forms must cancel.
#[rstest]
#[case(" (Bug 1002)")]
#[case("")]
fn test_commit_and_backout_in_same_push_cancel(#[case] bug_note: &str) {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let sha = fx.tracked_commit(1002, "canvas-blend");
    fx.backout_commit(&[&sha], bug_note);

    let outcome = push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    assert!(outcome.pushed.is_empty());
    assert!(store.list(None, None).unwrap().is_empty());
    assert_eq!(fx.host.pr_count(), 0);
}

/// S3: a backout arriving in a later push empties the sync; it goes
/// incomplete, the PR is closed, and the side branch head stays put so the
/// PR can reopen on reland.
#[test]
fn test_late_backout_marks_sync_incomplete() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let sha = fx.tracked_commit(1003, "grid-span");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    let sync = UpstreamSync::latest_for_bug(&store, 1003).unwrap().unwrap();
    let pr = fx.host.only_pr();
    let branch_head_before = fx.wpt_branch_commits(&sync.branch_name());
    assert_eq!(branch_head_before.len(), 1);

    fx.backout_commit(&[&sha], " (Bug 1003)");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();

    let sync = UpstreamSync::latest_for_bug(&store, 1003).unwrap().unwrap();
    assert_eq!(sync.status(), Status::Incomplete);
    assert!(sync.gecko_commits(&env).unwrap().is_empty());
    // Closed at the host, but the branch head is untouched to keep the PR
    // reopenable
    assert_eq!(fx.host.pr(pr.number).state, PullState::Closed);
    assert!(fx.host.state.lock().unwrap().closed.contains(&pr.number));
    assert_eq!(fx.wpt_branch_commits(&sync.branch_name()), branch_head_before);
}

/// Reland after a backout: the incomplete sync revives and the PR reopens.
#[test]
fn test_reland_reopens_incomplete_sync() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let sha = fx.tracked_commit(1004, "flex-gap");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    let pr = fx.host.only_pr();

    fx.backout_commit(&[&sha], " (Bug 1004)");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    assert_eq!(
        UpstreamSync::latest_for_bug(&store, 1004).unwrap().unwrap().status(),
        Status::Incomplete
    );

    // Reland with a new sha
    fx.gecko_commit(
        "Bug 1004 - Add flex-gap test, r=reviewer",
        &[(
            &format!("{}/flex-gap.html", TRACKED_PATH),
            "<!doctype html>\n<title>flex-gap v2</title>\n",
        )],
    );
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();

    let sync = UpstreamSync::latest_for_bug(&store, 1004).unwrap().unwrap();
    assert_eq!(sync.status(), Status::Open);
    assert_eq!(sync.gecko_commits(&env).unwrap().len(), 1);
    assert_eq!(fx.host.pr(pr.number).state, PullState::Open);
    assert!(fx.host.state.lock().unwrap().reopened.contains(&pr.number));
    assert_eq!(fx.host.pr_count(), 1, "reuses the PR instead of opening another");
}

/// S4: a replay conflict with no PR yet retries and then surfaces through a
/// bug comment, a needinfo, and the sync's sticky error.
#[test]
fn test_replay_conflict_comments_and_needinfos() {
    let fx = SyncFixture::new();

    // Diverge the upstream copy of a file the gecko commit will touch
    std::fs::write(
        fx.wpt_dir.join("existing.html"),
        "<!doctype html>\n<title>diverged upstream</title>\n",
    )
    .unwrap();
    common_git(&fx.wpt_dir, &["add", "."]);
    common_git(&fx.wpt_dir, &["commit", "-qm", "Diverge existing.html"]);
    common_git(&fx.wpt_dir, &["push", "-q", "origin", "master"]);

    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    fx.gecko_commit(
        "Bug 1005 - Update existing test, r=reviewer",
        &[(
            &format!("{}/existing.html", TRACKED_PATH),
            "<!doctype html>\n<title>updated in gecko</title>\n",
        )],
    );
    let outcome = push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, false).unwrap();
    assert_eq!(outcome.failed.len(), 1);

    let sync = UpstreamSync::latest_for_bug(&store, 1005).unwrap().unwrap();
    assert_eq!(sync.status(), Status::Open, "stays open so replays keep trying");
    assert!(sync.error().unwrap().contains("conflict"));
    assert!(
        fx.bz
            .comments_for(1005)
            .iter()
            .any(|c| c.contains("merge conflicts"))
    );
    let needinfos = fx.bz.state.lock().unwrap().needinfos.clone();
    assert_eq!(
        needinfos,
        [(1005, vec!["wpt-admin@mozilla.example".to_string()])]
    );
    assert_eq!(fx.host.pr_count(), 0);
}

/// S5: a checks-failure notification comments once and needinfos the patch
/// author; a duplicate delivery is ignored; success on a landed commit
/// merges.
#[test]
fn test_check_notifications_deduplicate_then_land() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let sha = fx.tracked_commit(1006, "idle-detect");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    let pr = fx.host.only_pr();
    let mut sync = UpstreamSync::latest_for_bug(&store, 1006).unwrap().unwrap();

    fx.host.set_check(pr.number, "wpt-chrome", "completed", Some("failure"));
    let landed = push::commit_check_changed(&lock, &env, &mut sync).unwrap();
    assert!(!landed);
    let failure_comments = fx
        .bz
        .comments_for(1006)
        .iter()
        .filter(|c| c.contains("failing upstream checks"))
        .count();
    assert_eq!(failure_comments, 1);
    assert!(
        fx.bz
            .comments_for(1006)
            .iter()
            .any(|c| c.contains("wpt-chrome"))
    );
    let needinfos = fx.bz.state.lock().unwrap().needinfos.clone();
    assert_eq!(needinfos, [(1006, vec!["dev@mozilla.example".to_string()])]);
    let check = sync.last_pr_check().unwrap().clone();
    assert_eq!(check.state, "failure");

    // Same (state, head) delivered again: no duplicate comment
    let landed = push::commit_check_changed(&lock, &env, &mut sync).unwrap();
    assert!(!landed);
    let failure_comments = fx
        .bz
        .comments_for(1006)
        .iter()
        .filter(|c| c.contains("failing upstream checks"))
        .count();
    assert_eq!(failure_comments, 1);

    // Checks go green and the commit reaches central: the PR merges
    fx.host.set_check(pr.number, "wpt-chrome", "completed", Some("success"));
    fx.host.approve(pr.number);
    fx.land_on_central(&sha);
    let landed = push::commit_check_changed(&lock, &env, &mut sync).unwrap();
    assert!(landed);
    assert_eq!(sync.status(), Status::WptMerged);
    assert!(sync.error().is_none());
}

/// S6: a backout of a commit no sync knows about, quoting no bug, files a
/// fresh bug and binds a sync to it.
#[test]
fn test_orphan_backout_files_bug() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    // The backed-out commit predates the processed range
    let old = fx.tracked_commit(1007, "orphaned");
    let boundary = fx.gecko_commit("Bug 1 - Unrelated", &[("README", "gecko v2\n")]);
    fx.backout_commit(&[&old], "");

    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, Some(&boundary), true).unwrap();

    let filed = fx.bz.state.lock().unwrap().filed.clone();
    assert_eq!(filed.len(), 1);
    assert_eq!(filed[0].whiteboard, "[wptsync upstream]");
    assert!(filed[0].summary.starts_with("Upstream commit"));
    let ids = store.list(None, Some(filed[0].id)).unwrap();
    assert_eq!(ids.len(), 1, "sync bound to the fresh bug");
}

/// Empty push range: nothing is created, nothing mutated.
#[test]
fn test_empty_push_range_is_a_no_op() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let outcome = push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    assert!(outcome.pushed.is_empty());
    assert!(outcome.landed.is_empty());
    assert!(store.list(None, None).unwrap().is_empty());
}

/// A PR closed by a human without merging gets one comment and a mirrored
/// pr-status.
#[test]
fn test_pr_closed_without_merge() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    fx.tracked_commit(1008, "popover");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();
    let mut sync = UpstreamSync::latest_for_bug(&store, 1008).unwrap().unwrap();

    for _ in 0..2 {
        push::update_pr(
            &lock,
            &env,
            &mut sync,
            PrEvent::Closed {
                merge_sha: None,
                base_sha: None,
                merged_by: None,
            },
        )
        .unwrap();
    }
    assert_eq!(sync.pr_status(), PrStatus::Closed);
    let close_comments = fx
        .bz
        .comments_for(1008)
        .iter()
        .filter(|c| c.contains("closed without merging"))
        .count();
    assert_eq!(close_comments, 1);
}

/// Multiple commits for one bug in one push accrete into a single sync, and
/// the replay preserves their order.
#[test]
fn test_multiple_commits_one_sync_order_preserved() {
    let fx = SyncFixture::new();
    let env = fx.environment();
    let store = fx.store(&env);
    let lock = fx.lock();

    let first = fx.tracked_commit(1009, "scroll-a");
    let second = fx.tracked_commit(1009, "scroll-b");
    let third = fx.tracked_commit(1009, "scroll-c");
    push::gecko_push(&lock, &env, &store, AUTOLAND_REF, None, true).unwrap();

    let syncs = UpstreamSync::for_bug(&store, 1009, &[Status::Open]).unwrap();
    assert_eq!(syncs.len(), 1);
    let replays = fx.wpt_branch_commits(&syncs[0].branch_name());
    assert_eq!(replays.len(), 3);
    let origins: Vec<String> = replays
        .iter()
        .map(|sha| {
            get_metadata(&fx.wpt_commit_message(sha))
                .get("gecko-commit")
                .unwrap()
                .clone()
        })
        .collect();
    assert_eq!(origins, [first, second, third]);
    assert_eq!(fx.host.pr_count(), 1);
}

fn common_git(dir: &std::path::Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}
