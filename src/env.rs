//! Process environment: configuration plus the external service clients.
//!
//! Built once at startup and passed explicitly through constructors and
//! reconciler calls; no module reaches for it ambiently.

use crate::bugzilla::BugTracker;
use crate::config::Config;
use crate::gh::PrHost;
use crate::git::Repository;

pub struct Environment {
    pub config: Config,
    pub gecko: Repository,
    pub wpt: Repository,
    pub bz: Box<dyn BugTracker>,
    pub gh: Box<dyn PrHost>,
}

impl Environment {
    /// Open the repositories named by `config` and assemble the environment.
    pub fn new(
        config: Config,
        bz: Box<dyn BugTracker>,
        gh: Box<dyn PrHost>,
    ) -> anyhow::Result<Self> {
        let gecko = Repository::at("gecko", config.gecko_repo_path())?;
        let wpt = Repository::at("wpt", config.wpt_repo_path())?;
        Ok(Self {
            config,
            gecko,
            wpt,
            bz,
            gh,
        })
    }

    /// Like [`Environment::new`] but with the repositories already open.
    /// Used by tests that build repositories in temp dirs.
    pub fn with_repos(
        config: Config,
        gecko: Repository,
        wpt: Repository,
        bz: Box<dyn BugTracker>,
        gh: Box<dyn PrHost>,
    ) -> Self {
        Self {
            config,
            gecko,
            wpt,
            bz,
            gh,
        }
    }

    /// Which repository name a gecko commit should be attributed to in
    /// replay metadata. Central is checked before the integration branch: a
    /// commit that has merged to central belongs to central even though it
    /// is also reachable from the integration ref.
    pub fn gecko_repo_name(&self, sha: &str) -> anyhow::Result<String> {
        if self.gecko.is_ancestor(sha, &self.config.gecko.refs.central)? {
            return Ok("mozilla-central".to_string());
        }
        if self.gecko.is_ancestor(sha, &self.config.gecko.refs.integration)? {
            return Ok(self.config.gecko.integration_name.clone());
        }
        anyhow::bail!("Commit {} not part of any configured repository", sha)
    }
}
