//! Per-iteration evidence: the captured diff and the commands run.
//!
//! An [`EvalContext`] is created fresh for every iteration and never shared
//! between iterations or tests. Its [`EvalContext::logs`] rendering is what
//! the judge sees.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::{Environment, ExecOptions, ExecOutput};
use crate::error::EnvironmentError;

/// Outcome of one named command run during an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub name: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn from_output(name: impl Into<String>, command: impl Into<String>, out: ExecOutput) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
            duration_ms: out.duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Serializable copy of a context, stored with each ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub diff: Option<String>,
    pub commands: Vec<CommandResult>,
}

/// Mutable evidence record for one iteration.
pub struct EvalContext {
    environment: Arc<dyn Environment>,
    root: PathBuf,
    diff: Option<String>,
    commands: Vec<CommandResult>,
}

impl EvalContext {
    pub fn new(environment: Arc<dyn Environment>, root: impl Into<PathBuf>) -> Self {
        Self {
            environment,
            root: root.into(),
            diff: None,
            commands: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    /// Replaces the stored diff with the environment's current diff.
    ///
    /// A clean tree stores `Some("")`, distinct from "never captured".
    pub async fn store_diff(&mut self) -> Result<&str, EnvironmentError> {
        let diff = self.environment.diff(&self.root).await?;
        debug!(root = %self.root.display(), bytes = diff.len(), "Captured diff");
        Ok(self.diff.insert(diff).as_str())
    }

    /// Runs `command` in the workspace and appends the result.
    ///
    /// A failing command is recorded, not raised.
    pub async fn run_command(
        &mut self,
        name: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> CommandResult {
        let options = ExecOptions {
            timeout,
            ..Default::default()
        };
        let out = self.environment.execute(command, &self.root, options).await;
        debug!(name = name, exit_code = out.exit_code, duration_ms = out.duration_ms, "Command finished");
        let result = CommandResult::from_output(name, command, out);
        self.commands.push(result.clone());
        result
    }

    pub fn diff(&self) -> Option<&str> {
        self.diff.as_deref()
    }

    /// Copy of the command list in invocation order.
    pub fn commands(&self) -> Vec<CommandResult> {
        self.commands.clone()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            diff: self.diff.clone(),
            commands: self.commands.clone(),
        }
    }

    pub fn logs(&self) -> String {
        render_logs(self.diff.as_deref(), &self.commands)
    }
}

/// Deterministic text rendering of captured evidence.
pub fn render_logs(diff: Option<&str>, commands: &[CommandResult]) -> String {
    let mut out = String::new();

    if let Some(diff) = diff {
        out.push_str("=== DIFF ===\n");
        if diff.is_empty() {
            out.push_str("(no changes)\n");
        } else {
            out.push_str(diff);
            if !diff.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push('\n');
    }

    for cmd in commands {
        let _ = writeln!(out, "=== COMMAND: {} ===", cmd.name);
        let _ = writeln!(out, "$ {}", cmd.command);
        let _ = writeln!(out, "exit code: {}", cmd.exit_code);
        push_stream(&mut out, "stdout", &cmd.stdout);
        push_stream(&mut out, "stderr", &cmd.stderr);
        out.push('\n');
    }

    out
}

fn push_stream(out: &mut String, label: &str, text: &str) {
    let _ = writeln!(out, "--- {label} ---");
    if !text.is_empty() {
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push('\n');
        }
    }
}

impl ContextSnapshot {
    pub fn logs(&self) -> String {
        render_logs(self.diff.as_deref(), &self.commands)
    }
}
