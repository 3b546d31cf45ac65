//! Test fixtures: a gecko repository, a wpt repository with a bare origin,
//! and in-memory stand-ins for the PR host and bug tracker.
//!
//! Everything runs against real git repositories in a temp dir, so the
//! fixtures exercise the same plumbing as production; only the network
//! services are faked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tempfile::TempDir;

use wptsync::bugzilla::{self, BugTracker};
use wptsync::config::{CONFIG_FILE, Config};
use wptsync::env::Environment;
use wptsync::gh::{CheckRun, PrHost, PullRequest, PullState};
use wptsync::git::Repository;
use wptsync::lock::ProcessLock;
use wptsync::store::SyncStore;

pub const TRACKED_PATH: &str = "testing/web-platform/tests";
pub const CENTRAL_REF: &str = "refs/remotes/mozilla/central";
pub const AUTOLAND_REF: &str = "refs/remotes/mozilla/autoland";
pub const BUGZILLA_URL: &str = "https://bugzilla.example.org";

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("GIT_AUTHOR_DATE", "2025-01-01T00:00:00Z")
        .env("GIT_COMMITTER_DATE", "2025-01-01T00:00:00Z")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} in {}: {}{}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// A complete sync environment in a temp dir.
pub struct SyncFixture {
    // Owns every path below; dropped last
    _tmp: TempDir,
    pub root: PathBuf,
    pub gecko_dir: PathBuf,
    pub wpt_dir: PathBuf,
    pub wpt_remote_dir: PathBuf,
    pub host: MockPrHost,
    pub bz: MockBugTracker,
}

impl SyncFixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        // Gecko: plain repository; the integration/central "remotes" are
        // plain refs moved by the tests
        let gecko_dir = root.join("repos/gecko");
        std::fs::create_dir_all(&gecko_dir).unwrap();
        run_git(&gecko_dir, &["init", "-q", "--initial-branch=main"]);
        run_git(&gecko_dir, &["config", "user.name", "Gecko Dev"]);
        run_git(&gecko_dir, &["config", "user.email", "dev@mozilla.example"]);
        std::fs::create_dir_all(gecko_dir.join(TRACKED_PATH)).unwrap();
        std::fs::write(
            gecko_dir.join(TRACKED_PATH).join("existing.html"),
            "<!doctype html>\n<title>existing</title>\n",
        )
        .unwrap();
        std::fs::write(gecko_dir.join("README"), "gecko\n").unwrap();
        run_git(&gecko_dir, &["add", "."]);
        run_git(&gecko_dir, &["commit", "-qm", "Initial import"]);
        let initial = run_git(&gecko_dir, &["rev-parse", "HEAD"]);
        run_git(&gecko_dir, &["update-ref", CENTRAL_REF, initial.trim()]);
        run_git(&gecko_dir, &["update-ref", AUTOLAND_REF, initial.trim()]);

        // Wpt: a bare origin plus a working clone. The tracked subtree's
        // initial content matches gecko's so modification patches apply.
        let wpt_remote_dir = tmp.path().join("wpt-origin.git");
        run_git(
            tmp.path(),
            &[
                "init",
                "-q",
                "--bare",
                "--initial-branch=master",
                wpt_remote_dir.to_str().unwrap(),
            ],
        );
        let wpt_dir = root.join("repos/web-platform-tests");
        std::fs::create_dir_all(wpt_dir.parent().unwrap()).unwrap();
        run_git(
            root.as_path(),
            &[
                "clone",
                "-q",
                wpt_remote_dir.to_str().unwrap(),
                wpt_dir.to_str().unwrap(),
            ],
        );
        run_git(&wpt_dir, &["config", "user.name", "wpt-sync"]);
        run_git(&wpt_dir, &["config", "user.email", "wptsync@mozilla.example"]);
        std::fs::write(
            wpt_dir.join("existing.html"),
            "<!doctype html>\n<title>existing</title>\n",
        )
        .unwrap();
        run_git(&wpt_dir, &["add", "."]);
        run_git(&wpt_dir, &["commit", "-qm", "Initial wpt import"]);
        run_git(&wpt_dir, &["push", "-q", "origin", "master"]);

        std::fs::write(
            root.join(CONFIG_FILE),
            format!(
                r#"
[gecko]
needinfo = ["wpt-admin@mozilla.example"]
[wpt]
[github]
repo = "web-platform-tests/wpt"
[bugzilla]
url = "{}"
"#,
                BUGZILLA_URL
            ),
        )
        .unwrap();

        let host = MockPrHost::new(&wpt_remote_dir);
        let bz = MockBugTracker::new();

        Self {
            _tmp: tmp,
            root,
            gecko_dir,
            wpt_dir,
            wpt_remote_dir,
            host,
            bz,
        }
    }

    pub fn environment(&self) -> Environment {
        let config = Config::load_from(&self.root).unwrap();
        let gecko = Repository::at("gecko", &self.gecko_dir).unwrap();
        let wpt = Repository::at("wpt", &self.wpt_dir).unwrap();
        Environment::with_repos(
            config,
            gecko,
            wpt,
            Box::new(self.bz.clone()),
            Box::new(self.host.clone()),
        )
    }

    pub fn store(&self, env: &Environment) -> SyncStore {
        SyncStore::new(&env.gecko)
    }

    pub fn lock(&self) -> ProcessLock {
        ProcessLock::acquire(&self.root, "upstream").unwrap()
    }

    // =========================================================================
    // Gecko-side history building
    // =========================================================================

    /// Commit files on gecko main and advance the autoland ref. Returns the
    /// full sha.
    pub fn gecko_commit(&self, message: &str, files: &[(&str, &str)]) -> String {
        for (path, content) in files {
            let path = self.gecko_dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        run_git(&self.gecko_dir, &["add", "."]);
        run_git(&self.gecko_dir, &["commit", "-qm", message]);
        let sha = run_git(&self.gecko_dir, &["rev-parse", "HEAD"])
            .trim()
            .to_string();
        run_git(&self.gecko_dir, &["update-ref", AUTOLAND_REF, &sha]);
        sha
    }

    /// Commit a tracked test change for a bug.
    pub fn tracked_commit(&self, bug: u64, name: &str) -> String {
        self.gecko_commit(
            &format!("Bug {} - Add {} test, r=reviewer", bug, name),
            &[(
                &format!("{}/{}.html", TRACKED_PATH, name),
                &format!("<!doctype html>\n<title>{}</title>\n", name),
            )],
        )
    }

    /// Commit a backout of `shas` by reverting them, advancing autoland.
    /// `bug_note` ends up in the message the way sheriffs write it.
    pub fn backout_commit(&self, shas: &[&str], bug_note: &str) -> String {
        for sha in shas.iter().rev() {
            run_git(&self.gecko_dir, &["revert", "--no-commit", sha]);
        }
        let message = format!(
            "Backed out {} changeset{} {}{} for causing failures",
            shas.len(),
            if shas.len() == 1 { "" } else { "s" },
            shas.join(" "),
            bug_note,
        );
        run_git(&self.gecko_dir, &["commit", "-qm", &message]);
        let sha = run_git(&self.gecko_dir, &["rev-parse", "HEAD"])
            .trim()
            .to_string();
        run_git(&self.gecko_dir, &["update-ref", AUTOLAND_REF, &sha]);
        sha
    }

    /// Mark everything up to `sha` as durably landed.
    pub fn land_on_central(&self, sha: &str) {
        run_git(&self.gecko_dir, &["update-ref", CENTRAL_REF, sha]);
    }

    /// Shas on the wpt side branch, parents first.
    pub fn wpt_branch_commits(&self, branch: &str) -> Vec<String> {
        run_git(
            &self.wpt_dir,
            &[
                "rev-list",
                "--reverse",
                &format!("origin/master..refs/heads/{}", branch),
            ],
        )
        .lines()
        .map(|line| line.trim().to_string())
        .collect()
    }

    pub fn wpt_commit_message(&self, sha: &str) -> String {
        run_git(&self.wpt_dir, &["show", "--no-patch", "--format=%B", sha])
    }

    /// Branch names present on the wpt origin.
    pub fn remote_branches(&self) -> Vec<String> {
        run_git(
            &self.wpt_remote_dir,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads/"],
        )
        .lines()
        .map(|line| line.trim().to_string())
        .collect()
    }
}

// =============================================================================
// Mock bug tracker
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FiledBug {
    pub id: u64,
    pub summary: String,
    pub whiteboard: String,
}

#[derive(Debug, Default)]
pub struct BzState {
    pub next_id: u64,
    pub filed: Vec<FiledBug>,
    pub comments: Vec<(u64, String)>,
    pub needinfos: Vec<(u64, Vec<String>)>,
}

#[derive(Clone)]
pub struct MockBugTracker {
    pub state: Arc<Mutex<BzState>>,
}

impl MockBugTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BzState {
                next_id: 100000,
                ..Default::default()
            })),
        }
    }

    pub fn comments_for(&self, bug: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(b, _)| *b == bug)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl BugTracker for MockBugTracker {
    fn file_bug(
        &self,
        summary: &str,
        _body: &str,
        _product: &str,
        _component: &str,
        whiteboard: &str,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.filed.push(FiledBug {
            id,
            summary: summary.to_string(),
            whiteboard: whiteboard.to_string(),
        });
        Ok(id)
    }

    fn comment(&self, bug: u64, text: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .comments
            .push((bug, text.to_string()));
        Ok(())
    }

    fn comment_with_needinfo(
        &self,
        bug: u64,
        text: &str,
        users: &[String],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.comments.push((bug, text.to_string()));
        state.needinfos.push((bug, users.to_vec()));
        Ok(())
    }

    fn bug_url(&self, bug: u64) -> String {
        bugzilla::bug_url(BUGZILLA_URL, bug)
    }

    fn id_from_url(&self, url: &str) -> Option<u64> {
        bugzilla::id_from_url(BUGZILLA_URL, url)
    }
}

// =============================================================================
// Mock PR host
// =============================================================================

#[derive(Debug, Clone)]
pub struct MockPr {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub branch: String,
    pub state: PullState,
    pub merged: bool,
    pub merge_sha: Option<String>,
    pub mergeable: bool,
    pub approved: bool,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub next_pr: u64,
    pub prs: HashMap<u64, MockPr>,
    /// Check runs reported per PR
    pub checks: HashMap<u64, IndexMap<String, CheckRun>>,
    /// `(pr, state, description, context)` tuples from set_status calls
    pub statuses: Vec<(u64, String, String, String)>,
    pub closed: Vec<u64>,
    pub reopened: Vec<u64>,
}

#[derive(Clone)]
pub struct MockPrHost {
    remote: PathBuf,
    pub state: Arc<Mutex<HostState>>,
}

impl MockPrHost {
    pub fn new(remote: &Path) -> Self {
        Self {
            remote: remote.to_path_buf(),
            state: Arc::new(Mutex::new(HostState {
                next_pr: 0,
                ..Default::default()
            })),
        }
    }

    fn branch_head(&self, branch: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.remote)
            .output()
            .expect("failed to run git");
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    pub fn pr(&self, pr_id: u64) -> MockPr {
        self.state.lock().unwrap().prs.get(&pr_id).unwrap().clone()
    }

    pub fn only_pr(&self) -> MockPr {
        let state = self.state.lock().unwrap();
        assert_eq!(state.prs.len(), 1, "expected exactly one PR");
        state.prs.values().next().unwrap().clone()
    }

    pub fn pr_count(&self) -> usize {
        self.state.lock().unwrap().prs.len()
    }

    pub fn approve(&self, pr_id: u64) {
        self.state.lock().unwrap().prs.get_mut(&pr_id).unwrap().approved = true;
    }

    /// Report one check run with the given conclusion for the PR's head.
    pub fn set_check(&self, pr_id: u64, name: &str, status: &str, conclusion: Option<&str>) {
        let head_sha = {
            let state = self.state.lock().unwrap();
            let branch = state.prs.get(&pr_id).unwrap().branch.clone();
            drop(state);
            self.branch_head(&branch).unwrap_or_default()
        };
        self.state.lock().unwrap().checks.entry(pr_id).or_default().insert(
            name.to_string(),
            CheckRun {
                status: status.to_string(),
                conclusion: conclusion.map(String::from),
                required: true,
                head_sha,
                url: Some(format!("https://ci.example/{}/{}", pr_id, name)),
            },
        );
    }
}

impl PrHost for MockPrHost {
    fn get_pull(&self, pr_id: u64) -> anyhow::Result<PullRequest> {
        let pr = self.pr(pr_id);
        let head_sha = self.branch_head(&pr.branch).unwrap_or_default();
        Ok(PullRequest {
            number: pr.number,
            state: pr.state,
            merged: pr.merged,
            merge_commit_sha: pr.merge_sha.clone(),
            head_sha,
            title: pr.title.clone(),
            body: Some(pr.body.clone()),
            mergeable: Some(pr.mergeable),
        })
    }

    fn pull_state(&self, pr_id: u64) -> anyhow::Result<PullState> {
        Ok(self.pr(pr_id).state)
    }

    fn is_mergeable(&self, pr_id: u64) -> anyhow::Result<bool> {
        Ok(self.pr(pr_id).mergeable)
    }

    fn is_approved(&self, pr_id: u64) -> anyhow::Result<bool> {
        Ok(self.pr(pr_id).approved)
    }

    fn get_check_runs(&self, pr_id: u64) -> anyhow::Result<IndexMap<String, CheckRun>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checks
            .get(&pr_id)
            .cloned()
            .unwrap_or_default())
    }

    fn create_pull(
        &self,
        title: &str,
        body: &str,
        _base: &str,
        head: &str,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.next_pr += 1;
        let number = state.next_pr;
        state.prs.insert(
            number,
            MockPr {
                number,
                title: title.to_string(),
                body: body.to_string(),
                branch: head.to_string(),
                state: PullState::Open,
                merged: false,
                merge_sha: None,
                mergeable: true,
                approved: false,
            },
        );
        Ok(number)
    }

    fn close_pull(&self, pr_id: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.prs.get_mut(&pr_id).unwrap().state = PullState::Closed;
        state.closed.push(pr_id);
        Ok(())
    }

    fn reopen_pull(&self, pr_id: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.prs.get_mut(&pr_id).unwrap().state = PullState::Open;
        state.reopened.push(pr_id);
        Ok(())
    }

    fn merge_pull(&self, pr_id: u64) -> anyhow::Result<String> {
        let branch = self.pr(pr_id).branch.clone();
        let merge_sha = self
            .branch_head(&branch)
            .ok_or_else(|| anyhow::anyhow!("branch {} missing upstream", branch))?;
        let mut state = self.state.lock().unwrap();
        let pr = state.prs.get_mut(&pr_id).unwrap();
        pr.merged = true;
        pr.state = PullState::Closed;
        pr.merge_sha = Some(merge_sha.clone());
        Ok(merge_sha)
    }

    fn merge_sha(&self, pr_id: u64) -> anyhow::Result<Option<String>> {
        let pr = self.pr(pr_id);
        Ok(if pr.merged { pr.merge_sha } else { None })
    }

    fn set_status(
        &self,
        pr_id: u64,
        state: &str,
        _target_url: &str,
        description: &str,
        context: &str,
    ) -> anyhow::Result<()> {
        self.state.lock().unwrap().statuses.push((
            pr_id,
            state.to_string(),
            description.to_string(),
            context.to_string(),
        ));
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> anyhow::Result<bool> {
        Ok(self.branch_head(branch).is_some())
    }

    fn get_commit_messages(&self, pr_id: u64) -> anyhow::Result<Vec<String>> {
        // Read the PR branch from the bare origin
        let branch = self.pr(pr_id).branch.clone();
        let output = Command::new("git")
            .args([
                "log",
                "--reverse",
                "--format=%B%x00",
                &format!("refs/heads/{}", branch),
                "--not",
                "refs/heads/master",
            ])
            .current_dir(&self.remote)
            .output()
            .expect("failed to run git");
        anyhow::ensure!(output.status.success(), "git log failed");
        Ok(String::from_utf8_lossy(&output.stdout)
            .split('\0')
            .map(|msg| msg.trim().to_string())
            .filter(|msg| !msg.is_empty())
            .collect())
    }

    fn pr_url(&self, pr_id: u64) -> String {
        format!("https://github.com/web-platform-tests/wpt/pull/{}", pr_id)
    }
}
