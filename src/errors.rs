//! Error taxonomy for the sync engine.

use crate::git::GitError;

/// Failure classes with distinct handling policies.
///
/// The batch loops catch everything except `Invariant` into the sync's sticky
/// `error` field and keep going; `Invariant` aborts the whole command.
/// `Abort` is flow control, not a failure: an intentional early return whose
/// outcome is a no-op.
#[derive(Debug)]
pub enum SyncError {
    /// Network or git transport failure; state is left untouched
    Transient(String),
    /// Replay produced a merge conflict
    Conflict(String),
    /// Broken state-machine transition or mutation-token misuse
    Invariant(String),
    /// The remote PR diverged from local state in a way requiring a human
    RemoteMismatch(String),
    /// Intentional early no-op return
    Abort(String),
}

impl SyncError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, SyncError::Invariant(_))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, SyncError::Abort(_))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Transient(msg) => write!(f, "{}", msg),
            SyncError::Conflict(msg) => write!(f, "merge conflict: {}", msg),
            SyncError::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            SyncError::RemoteMismatch(msg) => write!(f, "{}", msg),
            SyncError::Abort(msg) => write!(f, "aborted: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<SyncError>() {
            Ok(sync_error) => sync_error,
            Err(e) => match e.downcast::<GitError>() {
                Ok(GitError::PatchDoesNotApply { rev, output }) => {
                    SyncError::Conflict(format!("{}: {}", rev, output))
                }
                Ok(git_error) => SyncError::Transient(git_error.to_string()),
                Err(e) => SyncError::Transient(format!("{:#}", e)),
            },
        }
    }
}

impl From<GitError> for SyncError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::PatchDoesNotApply { rev, output } => {
                SyncError::Conflict(format!("{}: {}", rev, output))
            }
            other => SyncError::Transient(other.to_string()),
        }
    }
}
