//! Git error types and formatting

#[derive(Debug)]
pub enum GitError {
    /// Generic command failure with the combined stderr/stdout text
    CommandFailed(String),
    /// Error for parsing failures
    ParseError(String),
    /// A ref that was expected to exist could not be resolved
    RefNotFound(String),
    /// A replayed patch did not apply cleanly
    PatchDoesNotApply { rev: String, output: String },
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CommandFailed(msg) => write!(f, "{}", msg),
            GitError::ParseError(msg) => write!(f, "parse error: {}", msg),
            GitError::RefNotFound(name) => write!(f, "ref not found: {}", name),
            GitError::PatchDoesNotApply { rev, output } => {
                write!(f, "patch for {} does not apply:\n{}", rev, output)
            }
        }
    }
}

impl std::error::Error for GitError {}
