//! Judge that delegates to an external command.
//!
//! The command template may contain `{{prompt}}` (replaced by the shell-quoted
//! prompt) or `{{prompt_file}}` (replaced by the path of a temporary file
//! holding the prompt). Without either placeholder the prompt is written to
//! the command's stdin. Stdout must be exactly one JSON verdict object.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{parse_verdict, Judge, JudgeRequest, JudgeResult};
use crate::environment::{run_shell, shell_quote, ExecOptions};
use crate::error::JudgeError;

pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";
pub const PROMPT_FILE_PLACEHOLDER: &str = "{{prompt_file}}";

/// Default limit for one judge command.
pub const DEFAULT_JUDGE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct CliJudge {
    command: String,
    timeout: Duration,
    workdir: PathBuf,
    identity: String,
}

impl CliJudge {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            identity: format!("cli:{}", command),
            command,
            timeout: DEFAULT_JUDGE_TIMEOUT,
            workdir: PathBuf::from("."),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Judge for CliJudge {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError> {
        let mut options = ExecOptions::with_timeout(self.timeout);
        // Kept alive until the command finishes.
        let mut prompt_file = None;

        let command = if self.command.contains(PROMPT_FILE_PLACEHOLDER) {
            let mut file = tempfile::Builder::new()
                .prefix("judge-forge-prompt-")
                .suffix(".md")
                .tempfile()?;
            file.write_all(request.prompt.as_bytes())?;
            file.flush()?;
            let path = shell_quote(&file.path().to_string_lossy());
            prompt_file = Some(file);
            self.command.replace(PROMPT_FILE_PLACEHOLDER, &path)
        } else if self.command.contains(PROMPT_PLACEHOLDER) {
            self.command
                .replace(PROMPT_PLACEHOLDER, &shell_quote(&request.prompt))
        } else {
            options = options.with_stdin(request.prompt.clone());
            self.command.clone()
        };

        if let Some(model) = &request.model {
            options = options.with_env("JUDGE_FORGE_MODEL", model.clone());
        }

        debug!(judge = %self.identity, "Running judge command");
        let out = run_shell(&command, &self.workdir, &options).await;
        drop(prompt_file);

        if out.timed_out {
            return Err(JudgeError::Timeout(self.timeout));
        }
        if !out.is_success() {
            return Err(JudgeError::CommandFailed {
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }

        let stdout = out.stdout.trim();
        if !stdout.starts_with('{') || !stdout.ends_with('}') {
            return Err(JudgeError::InvalidResponse(format!(
                "judge command must print a single JSON object, got: {}",
                stdout.chars().take(200).collect::<String>()
            )));
        }
        parse_verdict(stdout)
    }
}
