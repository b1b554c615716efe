//! Workspace environments.
//!
//! An [`Environment`] decides where the agent's changes happen: it prepares a
//! workspace, runs shell commands in it, reports the diff against the last
//! commit and tears it down again.
//!
//! # Variants
//!
//! - [`LocalEnvironment`]: the workspace is a git checkout on the host. Either
//!   reset to a pristine state on setup, or snapshot-and-restore the user's
//!   uncommitted work.
//! - [`ContainerEnvironment`]: commands run inside a Docker container with the
//!   workspace bind-mounted.
//!
//! Command failures (non-zero exit, timeouts) are always returned as
//! [`ExecOutput`] values. Only setup, teardown and diff capture can fail.

pub mod container;
pub mod git;
pub mod local;
pub mod process;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EnvironmentError;

pub use container::{ContainerConfig, ContainerEnvironment};
pub use local::{IsolationMode, LocalEnvironment};
pub use process::{run_shell, shell_quote};

/// Timeout applied when a caller does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code reported for commands killed on timeout (matches coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Hard limit; [`DEFAULT_COMMAND_TIMEOUT`] when `None`.
    pub timeout: Option<Duration>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Data written to the command's stdin.
    pub stdin: Option<String>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecOutput {
    /// A failed result for a command that could not run at all.
    pub fn failure(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
            duration_ms: elapsed.as_millis() as u64,
            timed_out: false,
        }
    }

    /// A failed result for a command killed after `timeout`.
    pub fn timed_out(timeout: Duration, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Command timed out after {} ms", timeout.as_millis()),
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: elapsed.as_millis() as u64,
            timed_out: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where code changes happen.
///
/// Implementations keep any per-workspace state keyed by workspace root, so
/// one instance can serve independently isolated workspaces concurrently.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Short identifier used in logs and ledger entries.
    fn name(&self) -> &str;

    /// Prepares `root` for an iteration.
    async fn setup(&self, root: &Path) -> Result<(), EnvironmentError>;

    /// Runs a shell command. Never fails: problems are reported in the output.
    async fn execute(&self, command: &str, cwd: &Path, options: ExecOptions) -> ExecOutput;

    /// Staged and unstaged changes relative to the last commit, followed by
    /// added-file diffs for untracked files.
    async fn diff(&self, root: &Path) -> Result<String, EnvironmentError>;

    /// Releases resources held for `root`.
    async fn teardown(&self, _root: &Path) -> Result<(), EnvironmentError> {
        Ok(())
    }
}
