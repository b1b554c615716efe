//! Agent runners.
//!
//! A runner receives the test prompt and changes the workspace:
//!
//! ```text
//! prompt → AgentRunner → (shell agent process | model-generated files) → workspace
//! ```
//!
//! - [`CliRunner`] launches a command-line agent through the environment.
//! - [`ApiRunner`] asks a model for complete file contents and writes them.
//!
//! Runners report what happened; they never judge it. A shell agent that
//! exits non-zero still produces [`RunnerOutput::Process`].

pub mod api;
pub mod cli;
pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::environment::{Environment, ExecOutput};
use crate::error::RunnerError;

pub use api::ApiRunner;
pub use cli::CliRunner;
pub use config::{RunnerConfig, RunnerKind};

/// Where and how long a runner may work.
#[derive(Clone)]
pub struct RunContext {
    pub cwd: PathBuf,
    pub environment: Arc<dyn Environment>,
    /// Overrides the runner's own default limit.
    pub timeout: Option<Duration>,
}

impl RunContext {
    pub fn new(cwd: impl Into<PathBuf>, environment: Arc<dyn Environment>) -> Self {
        Self {
            cwd: cwd.into(),
            environment,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a runner produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerOutput {
    /// Output of a shell agent process.
    Process(ExecOutput),
    /// Workspace-relative paths written by an API agent.
    Files(Vec<PathBuf>),
}

impl RunnerOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerOutput::Process(out) => Some(out.exit_code),
            RunnerOutput::Files(_) => None,
        }
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Runner identity recorded with each ledger entry.
    fn name(&self) -> &str;

    async fn execute(&self, prompt: &str, ctx: &RunContext) -> Result<RunnerOutput, RunnerError>;
}
