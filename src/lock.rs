//! Process-wide advisory locking.
//!
//! One OS process runs one command at a time. Every command that may mutate
//! syncs takes the exclusive `upstream` lock at entry and holds it until
//! exit; webhook-driven work is enqueued into the same lock region. The lock
//! also doubles as the capability token required to obtain a [`SyncMut`]
//! (see [`crate::upstream::UpstreamSync::for_mut`]), so a mutation without
//! the lock is a compile error rather than a runtime race.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;

/// Exclusive advisory lock over a named domain.
///
/// Blocks until acquired; released when dropped. Advisory only: peers must
/// go through the same lock file to be excluded.
#[derive(Debug)]
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock for `domain` under `root/locks/`, blocking.
    pub fn acquire(root: &Path, domain: &str) -> anyhow::Result<Self> {
        let locks_dir = root.join("locks");
        std::fs::create_dir_all(&locks_dir)
            .with_context(|| format!("Failed to create {}", locks_dir.display()))?;
        let path = locks_dir.join(format!("{}.lock", domain));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        log::debug!("Acquiring {} lock", domain);
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        log::debug!("Acquired {} lock", domain);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
