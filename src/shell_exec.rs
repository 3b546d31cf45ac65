//! Subprocess execution
//!
//! Provides a single builder for running external commands (`git`, `gh`).
//! All command execution goes through [`Cmd`] to ensure consistent logging:
//!
//! ```text
//! $ git rev-list a..b [gecko]        # with context
//! $ gh api repos/web-platform-tests/wpt/pulls/123
//! ```
//!
//! The `context` parameter is typically the repository name for git commands,
//! or `None` for standalone CLI tools like `gh`.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

/// Builder for subprocess invocations with debug logging and stdin piping.
///
/// # Examples
///
/// ```ignore
/// let output = Cmd::new("git")
///     .args(["rev-parse", "HEAD"])
///     .current_dir(&repo_path)
///     .context("gecko")
///     .run()?;
/// ```
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    context: Option<String>,
    stdin_data: Option<Vec<u8>>,
    envs: Vec<(String, String)>,
}

impl Cmd {
    /// Create a new command builder for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            context: None,
            stdin_data: None,
            envs: Vec::new(),
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the logging context (typically the repository name for git commands).
    pub fn context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Set data to write to the command's stdin.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));
        self
    }

    /// Execute the command and return its output.
    pub fn run(self) -> std::io::Result<std::process::Output> {
        let cmd_str = if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        };

        match &self.context {
            Some(ctx) => log::debug!("$ {} [{}]", cmd_str, ctx),
            None => log::debug!("$ {}", cmd_str),
        }

        let t0 = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        // Parts of the git toolchain require SHELL; containers often omit it
        if std::env::var_os("SHELL").is_none() {
            cmd.env("SHELL", "/bin/bash");
        }
        for (key, val) in &self.envs {
            cmd.env(key, val);
        }

        let result = if let Some(stdin_data) = self.stdin_data {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.spawn()?;

            // Ignore BrokenPipe - some commands exit before reading stdin
            if let Some(mut stdin) = child.stdin.take()
                && let Err(e) = stdin.write_all(&stdin_data)
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e);
            }

            child.wait_with_output()
        } else {
            cmd.output()
        };

        let duration_ms = t0.elapsed().as_secs_f64() * 1000.0;
        match (&result, &self.context) {
            (Ok(output), Some(ctx)) => {
                log::debug!(
                    "[trace] context={} cmd=\"{}\" dur={:.1}ms ok={}",
                    ctx,
                    cmd_str,
                    duration_ms,
                    output.status.success()
                );
            }
            (Ok(output), None) => {
                log::debug!(
                    "[trace] cmd=\"{}\" dur={:.1}ms ok={}",
                    cmd_str,
                    duration_ms,
                    output.status.success()
                );
            }
            (Err(e), _) => {
                log::debug!("[trace] cmd=\"{}\" dur={:.1}ms err=\"{}\"", cmd_str, duration_ms, e);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let output = Cmd::new("git").arg("--version").run().unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("git version"));
    }

    #[test]
    fn test_stdin_piping() {
        let output = Cmd::new("cat").stdin("hello").run().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
    }
}
