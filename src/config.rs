//! Configuration loading.
//!
//! State lives under a single root directory selected by `WPTSYNC_ROOT`
//! (falling back to the platform data dir). The root holds the two clones,
//! scratch worktrees, lock files, and `wptsync.toml`:
//!
//! ```toml
//! [gecko]
//! path = "repos/gecko"
//! tracked-path = "testing/web-platform/tests"
//!
//! [gecko.refs]
//! central = "refs/remotes/mozilla/central"
//! integration = "refs/remotes/mozilla/autoland"
//!
//! [wpt]
//! path = "repos/web-platform-tests"
//!
//! [github]
//! repo = "web-platform-tests/wpt"
//!
//! [bugzilla]
//! url = "https://bugzilla.mozilla.org"
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const ROOT_ENV_VAR: &str = "WPTSYNC_ROOT";
pub const CONFIG_FILE: &str = "wptsync.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// State directory; not set from the file
    #[serde(skip)]
    pub root: PathBuf,
    pub gecko: GeckoConfig,
    pub wpt: WptConfig,
    pub github: GithubConfig,
    pub bugzilla: BugzillaConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeckoConfig {
    /// Clone location, relative to the root
    #[serde(default = "default_gecko_path")]
    pub path: PathBuf,
    #[serde(default = "default_gecko_remote")]
    pub remote: String,
    /// The mirrored subtree
    #[serde(default = "default_tracked_path")]
    pub tracked_path: String,
    #[serde(default)]
    pub refs: GeckoRefs,
    /// Display name of the integration branch, recorded in replay metadata
    #[serde(default = "default_integration_name")]
    pub integration_name: String,
    /// Users to needinfo when a sync requires manual fixup
    #[serde(default)]
    pub needinfo: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeckoRefs {
    /// The canonical branch; a commit here has durably landed
    #[serde(default = "default_central_ref")]
    pub central: String,
    /// The moving integration branch new pushes land on
    #[serde(default = "default_integration_ref")]
    pub integration: String,
}

impl Default for GeckoRefs {
    fn default() -> Self {
        Self {
            central: default_central_ref(),
            integration: default_integration_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WptConfig {
    #[serde(default = "default_wpt_path")]
    pub path: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Ref new side branches start from
    #[serde(default = "default_wpt_base")]
    pub base_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GithubConfig {
    /// `owner/name` of the upstream repository
    #[serde(default = "default_github_repo")]
    pub repo: String,
    /// Account the bot merges as, quoted in bug comments
    #[serde(default = "default_github_user")]
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BugzillaConfig {
    #[serde(default = "default_bugzilla_url")]
    pub url: String,
    /// API key; the `BUGZILLA_API_KEY` environment variable overrides this
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_gecko_path() -> PathBuf {
    PathBuf::from("repos/gecko")
}

fn default_gecko_remote() -> String {
    "mozilla".to_string()
}

fn default_tracked_path() -> String {
    "testing/web-platform/tests".to_string()
}

fn default_integration_name() -> String {
    "autoland".to_string()
}

fn default_central_ref() -> String {
    "refs/remotes/mozilla/central".to_string()
}

fn default_integration_ref() -> String {
    "refs/remotes/mozilla/autoland".to_string()
}

fn default_wpt_path() -> PathBuf {
    PathBuf::from("repos/web-platform-tests")
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_wpt_base() -> String {
    "origin/master".to_string()
}

fn default_github_repo() -> String {
    "web-platform-tests/wpt".to_string()
}

fn default_github_user() -> String {
    "moz-wptsync-bot".to_string()
}

fn default_bugzilla_url() -> String {
    "https://bugzilla.mozilla.org".to_string()
}

impl Config {
    /// Load configuration from `WPTSYNC_ROOT`.
    pub fn load() -> anyhow::Result<Self> {
        let root = match std::env::var_os(ROOT_ENV_VAR) {
            Some(root) => PathBuf::from(root),
            None => dirs::data_dir()
                .context("No data directory; set WPTSYNC_ROOT")?
                .join("wptsync"),
        };
        Self::load_from(&root)
    }

    /// Load configuration rooted at an explicit directory.
    pub fn load_from(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.root = root.to_path_buf();
        if let Ok(key) = std::env::var("BUGZILLA_API_KEY") {
            config.bugzilla.api_key = Some(key);
        }
        Ok(config)
    }

    pub fn gecko_repo_path(&self) -> PathBuf {
        self.root.join(&self.gecko.path)
    }

    pub fn wpt_repo_path(&self) -> PathBuf {
        self.root.join(&self.wpt.path)
    }

    /// Scratch worktree directory for one sync's replay.
    pub fn work_dir(&self, branch: &str) -> PathBuf {
        self.root.join("work").join(branch.replace('/', "-"))
    }

    /// Branch PRs target on the upstream repository: the base ref with its
    /// remote prefix stripped.
    pub fn pr_base_branch(&self) -> String {
        self.wpt
            .base_ref
            .strip_prefix(&format!("{}/", self.wpt.remote))
            .unwrap_or(&self.wpt.base_ref)
            .to_string()
    }
}
