use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{AgentRunner, RunContext, RunnerOutput};
use crate::environment::{shell_quote, ExecOptions};
use crate::error::RunnerError;

pub const PROMPT_PLACEHOLDER: &str = "{{prompt}}";

/// Default limit for a shell agent run.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_millis(600_000);

/// Runs a command-line agent, e.g. `my-agent --yes -p {{prompt}}`.
pub struct CliRunner {
    name: String,
    command: String,
    timeout: Duration,
}

impl CliRunner {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command with the quoted prompt substituted, or appended when the
    /// template has no placeholder.
    pub fn render(&self, prompt: &str) -> String {
        let quoted = shell_quote(prompt);
        if self.command.contains(PROMPT_PLACEHOLDER) {
            self.command.replace(PROMPT_PLACEHOLDER, &quoted)
        } else {
            format!("{} {}", self.command, quoted)
        }
    }
}

#[async_trait]
impl AgentRunner for CliRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, prompt: &str, ctx: &RunContext) -> Result<RunnerOutput, RunnerError> {
        let timeout = ctx.timeout.unwrap_or(self.timeout);
        let command = self.render(prompt);

        info!(runner = %self.name, environment = ctx.environment.name(), "Running agent");
        let out = ctx
            .environment
            .execute(&command, &ctx.cwd, ExecOptions::with_timeout(timeout))
            .await;

        if out.timed_out {
            warn!(runner = %self.name, timeout_ms = timeout.as_millis() as u64, "Agent timed out");
        } else if !out.is_success() {
            warn!(runner = %self.name, exit_code = out.exit_code, "Agent exited with failure");
        }
        Ok(RunnerOutput::Process(out))
    }
}
