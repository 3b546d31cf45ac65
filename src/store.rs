//! Sync persistence.
//!
//! Each sync is a set of git refs in the gecko repository:
//!
//! ```text
//! refs/syncs/upstream/<status>/<seq>/<bug>/data    -> JSON blob of scalar fields
//! refs/syncs/upstream/<status>/<seq>/<bug>/gecko   -> gecko head commit
//! ```
//!
//! Status transitions rename the refs. The replayed commits live on a branch
//! `sync/upstream/<seq>/<bug>` in the wpt repository, named independently of
//! status so transitions never move the branch GitHub's PR points at. Using
//! the object database for the data blob gives atomic updates and free
//! replication with the repository itself.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::git::Repository;

const REF_PREFIX: &str = "refs/syncs/upstream";

/// Sync lifecycle state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Open,
    WptMerged,
    Complete,
    Incomplete,
}

impl Status {
    /// The transition relation. Anything outside this set is an invariant
    /// violation.
    pub fn can_transition_to(self, new: Status) -> bool {
        matches!(
            (self, new),
            (Status::Open, Status::WptMerged)
                | (Status::Open, Status::Complete)
                | (Status::Open, Status::Incomplete)
                | (Status::Incomplete, Status::Open)
                | (Status::WptMerged, Status::Complete)
        )
    }

    /// Whether the sync is done from the gecko side's point of view; the
    /// remote branch is released on entry to these states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::WptMerged | Status::Complete)
    }
}

/// Storage key of a sync: `(status, seq, bug)`.
///
/// `bug` is the primary key; `seq` disambiguates repeated syncs for the same
/// bug over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId {
    pub status: Status,
    pub seq: u32,
    pub bug: u64,
}

impl SyncId {
    fn ref_base(&self) -> String {
        format!("{}/{}/{}/{}", REF_PREFIX, self.status, self.seq, self.bug)
    }

    pub fn data_ref(&self) -> String {
        format!("{}/data", self.ref_base())
    }

    pub fn gecko_ref(&self) -> String {
        format!("{}/gecko", self.ref_base())
    }

    /// Name of the side branch in the wpt repository. Independent of status.
    pub fn branch_name(&self) -> String {
        format!("sync/upstream/{}/{}", self.seq, self.bug)
    }

    /// Parse `refs/syncs/upstream/<status>/<seq>/<bug>/<leaf>`, returning the
    /// id and the leaf name.
    fn from_ref(name: &str) -> Option<(SyncId, &str)> {
        let rest = name.strip_prefix(REF_PREFIX)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let status: Status = parts.next()?.parse().ok()?;
        let seq: u32 = parts.next()?.parse().ok()?;
        let bug: u64 = parts.next()?.parse().ok()?;
        let leaf = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some((SyncId { status, seq, bug }, leaf))
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream/{}/{}/{}", self.status, self.seq, self.bug)
    }
}

/// The `(state, head sha)` of the last processed CI notification, kept to
/// de-duplicate webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrCheck {
    pub state: String,
    pub head_sha: String,
}

/// Remote PR state mirrored locally.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    #[default]
    Open,
    Closed,
}

/// Mutable scalar fields of a sync, serialized into the data blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SyncData {
    pub pr: Option<u64>,
    pub pr_status: PrStatus,
    pub merge_sha: Option<String>,
    pub remote_branch: Option<String>,
    pub last_pr_check: Option<PrCheck>,
    pub error: Option<String>,
    /// Base of the gecko commit range (parent of the first commit)
    pub gecko_base: String,
    /// Base of the replayed range on the wpt side
    pub wpt_base: String,
}

/// Load, enumerate, and persist syncs in the gecko repository.
#[derive(Debug, Clone)]
pub struct SyncStore {
    repo: Repository,
}

impl SyncStore {
    pub fn new(repo: &Repository) -> Self {
        Self { repo: repo.clone() }
    }

    /// Create the refs for a new sync.
    pub fn create(&self, id: SyncId, data: &SyncData, gecko_head: &str) -> anyhow::Result<()> {
        if self.repo.read_ref(&id.data_ref())?.is_some() {
            bail!("Sync {} already exists", id);
        }
        self.write_data(id, data)?;
        self.repo.update_ref(&id.gecko_ref(), gecko_head)?;
        Ok(())
    }

    pub fn write_data(&self, id: SyncId, data: &SyncData) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(data).context("Failed to serialize sync data")?;
        let oid = self.repo.hash_object(&json)?;
        self.repo.update_ref(&id.data_ref(), &oid)
    }

    pub fn read_data(&self, id: SyncId) -> anyhow::Result<SyncData> {
        let oid = self
            .repo
            .read_ref(&id.data_ref())?
            .with_context(|| format!("Sync {} has no data ref", id))?;
        let json = self.repo.cat_blob(&oid)?;
        serde_json::from_str(&json).with_context(|| format!("Corrupt data blob for {}", id))
    }

    pub fn gecko_head(&self, id: SyncId) -> anyhow::Result<String> {
        self.repo
            .read_ref(&id.gecko_ref())?
            .with_context(|| format!("Sync {} has no gecko head ref", id))
    }

    pub fn set_gecko_head(&self, id: SyncId, sha: &str) -> anyhow::Result<()> {
        self.repo.update_ref(&id.gecko_ref(), sha)
    }

    /// All sync ids, optionally restricted by status and bug.
    pub fn list(&self, status: Option<Status>, bug: Option<u64>) -> anyhow::Result<Vec<SyncId>> {
        let mut ids = Vec::new();
        for (name, _) in self.repo.for_each_ref(REF_PREFIX)? {
            let Some((id, leaf)) = SyncId::from_ref(&name) else {
                log::warn!("Unparseable sync ref {}", name);
                continue;
            };
            if leaf != "data" {
                continue;
            }
            if status.is_some_and(|s| s != id.status) {
                continue;
            }
            if bug.is_some_and(|b| b != id.bug) {
                continue;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Sequence number for a new sync keyed by `bug`: one past the largest in
    /// use for that bug in any status.
    pub fn next_seq(&self, bug: u64) -> anyhow::Result<u32> {
        Ok(self
            .list(None, Some(bug))?
            .iter()
            .map(|id| id.seq + 1)
            .max()
            .unwrap_or(0))
    }

    /// Rename a sync's refs to a new status. The caller validates the
    /// transition; the store only moves refs.
    pub fn transition(&self, id: SyncId, new_status: Status) -> anyhow::Result<SyncId> {
        let new_id = SyncId {
            status: new_status,
            ..id
        };
        let data_oid = self
            .repo
            .read_ref(&id.data_ref())?
            .with_context(|| format!("Sync {} has no data ref", id))?;
        let gecko_head = self.gecko_head(id)?;
        self.repo.update_ref(&new_id.data_ref(), &data_oid)?;
        self.repo.update_ref(&new_id.gecko_ref(), &gecko_head)?;
        self.repo.delete_ref(&id.data_ref())?;
        self.repo.delete_ref(&id.gecko_ref())?;
        Ok(new_id)
    }

    pub fn delete(&self, id: SyncId) -> anyhow::Result<()> {
        self.repo.delete_ref(&id.data_ref())?;
        self.repo.delete_ref(&id.gecko_ref())?;
        Ok(())
    }

    // =========================================================================
    // Last sync point
    // =========================================================================

    fn last_sync_ref(repo_name: &str) -> String {
        format!("refs/syncs/last/{}", repo_name)
    }

    /// The last gecko commit processed for `repo_name`, if any.
    pub fn last_sync_point(&self, repo_name: &str) -> anyhow::Result<Option<String>> {
        self.repo.read_ref(&Self::last_sync_ref(repo_name))
    }

    pub fn set_last_sync_point(&self, repo_name: &str, sha: &str) -> anyhow::Result<()> {
        self.repo.update_ref(&Self::last_sync_ref(repo_name), sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_exec::Cmd;

    fn temp_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let output = Cmd::new("git")
                .args(args.iter().copied())
                .current_dir(dir.path())
                .run()
                .unwrap();
            assert!(
                output.status.success(),
                "git {:?}: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        };
        run(&["init", "-q", "--initial-branch=main"]);
        std::fs::write(dir.path().join("README"), "readme\n").unwrap();
        run(&["add", "README"]);
        run(&[
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "commit",
            "-qm",
            "initial",
        ]);
        let repo = Repository::at("gecko", dir.path()).unwrap();
        (dir, repo)
    }

    fn open_id(seq: u32, bug: u64) -> SyncId {
        SyncId {
            status: Status::Open,
            seq,
            bug,
        }
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::Open.can_transition_to(Status::WptMerged));
        assert!(Status::Open.can_transition_to(Status::Complete));
        assert!(Status::Open.can_transition_to(Status::Incomplete));
        assert!(Status::Incomplete.can_transition_to(Status::Open));
        assert!(Status::WptMerged.can_transition_to(Status::Complete));

        assert!(!Status::Complete.can_transition_to(Status::Open));
        assert!(!Status::WptMerged.can_transition_to(Status::Open));
        assert!(!Status::Incomplete.can_transition_to(Status::Complete));
        assert!(!Status::Open.can_transition_to(Status::Open));
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            Status::Open,
            Status::WptMerged,
            Status::Complete,
            Status::Incomplete,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<Status>().unwrap(), status);
        }
        assert_eq!(Status::WptMerged.to_string(), "wpt-merged");
    }

    #[test]
    fn test_sync_id_ref_round_trip() {
        let id = open_id(2, 1234);
        assert_eq!(id.data_ref(), "refs/syncs/upstream/open/2/1234/data");
        let data_ref = id.data_ref();
        let (parsed, leaf) = SyncId::from_ref(&data_ref).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(leaf, "data");
        assert_eq!(id.branch_name(), "sync/upstream/2/1234");
    }

    #[test]
    fn test_create_read_write_data() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        let id = open_id(0, 1000);

        let mut data = SyncData {
            gecko_base: head.clone(),
            wpt_base: "origin/master".to_string(),
            ..Default::default()
        };
        store.create(id, &data, &head).unwrap();
        assert_eq!(store.read_data(id).unwrap(), data);
        assert_eq!(store.gecko_head(id).unwrap(), head);

        data.pr = Some(42);
        data.error = Some("boom".to_string());
        store.write_data(id, &data).unwrap();
        assert_eq!(store.read_data(id).unwrap(), data);
    }

    #[test]
    fn test_create_twice_fails() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        let id = open_id(0, 1000);
        store.create(id, &SyncData::default(), &head).unwrap();
        assert!(store.create(id, &SyncData::default(), &head).is_err());
    }

    #[test]
    fn test_list_filters_by_status_and_bug() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        store.create(open_id(0, 1), &SyncData::default(), &head).unwrap();
        store.create(open_id(0, 2), &SyncData::default(), &head).unwrap();
        store
            .create(
                SyncId {
                    status: Status::Incomplete,
                    seq: 1,
                    bug: 1,
                },
                &SyncData::default(),
                &head,
            )
            .unwrap();

        assert_eq!(store.list(None, None).unwrap().len(), 3);
        assert_eq!(store.list(Some(Status::Open), None).unwrap().len(), 2);
        assert_eq!(store.list(None, Some(1)).unwrap().len(), 2);
        assert_eq!(store.list(Some(Status::Incomplete), Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_next_seq_counts_all_statuses() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        assert_eq!(store.next_seq(7).unwrap(), 0);
        store.create(open_id(0, 7), &SyncData::default(), &head).unwrap();
        assert_eq!(store.next_seq(7).unwrap(), 1);
        store
            .create(
                SyncId {
                    status: Status::Complete,
                    seq: 1,
                    bug: 7,
                },
                &SyncData::default(),
                &head,
            )
            .unwrap();
        assert_eq!(store.next_seq(7).unwrap(), 2);
    }

    #[test]
    fn test_transition_renames_refs() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        let id = open_id(0, 1000);
        store.create(id, &SyncData::default(), &head).unwrap();

        let new_id = store.transition(id, Status::Incomplete).unwrap();
        assert_eq!(new_id.status, Status::Incomplete);
        assert!(repo.read_ref(&id.data_ref()).unwrap().is_none());
        assert!(repo.read_ref(&new_id.data_ref()).unwrap().is_some());
        assert_eq!(store.gecko_head(new_id).unwrap(), head);
        // The branch name survives the rename
        assert_eq!(new_id.branch_name(), id.branch_name());
    }

    #[test]
    fn test_last_sync_point() {
        let (_dir, repo) = temp_repo();
        let store = SyncStore::new(&repo);
        let head = repo.rev_parse("HEAD").unwrap();
        assert_eq!(store.last_sync_point("autoland").unwrap(), None);
        store.set_last_sync_point("autoland", &head).unwrap();
        assert_eq!(store.last_sync_point("autoland").unwrap(), Some(head));
    }
}
