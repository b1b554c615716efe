//! Harness configuration.
//!
//! Loaded from a YAML file (conventionally `judge-forge.yaml` in the project
//! root), then adjusted by environment variables:
//!
//! - `JUDGE_FORGE_OUTPUT_DIR`: ledger directory, relative to the project root
//! - `JUDGE_FORGE_LEDGER`: `jsonl` or `sqlite`
//! - `JUDGE_FORGE_ITERATIONS`: default iterations per test
//!
//! ```yaml
//! output_dir: .judge-forge
//! ledger: sqlite
//! environment:
//!   type: local
//!   preserve_uncommitted: false
//! runners:
//!   - name: shell-agent
//!     type: cli
//!     command: "my-agent -p {{prompt}}"
//! judge:
//!   type: model
//!   provider: anthropic
//!   model: claude-sonnet-4
//! thresholds: { pass: 0.7, warn: 0.5 }
//! iterations: 1
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::environment::{
    ContainerConfig, ContainerEnvironment, Environment, IsolationMode, LocalEnvironment,
};
use crate::error::{ConfigError, ValidationError};
use crate::judge::{CliJudge, Judge, JudgeContext, ModelJudge};
use crate::ledger::{self, Ledger, LedgerBackend};
use crate::llm::{ChatClient, ModelCapability, ProviderConfig};
use crate::orchestrator::{Orchestrator, DEFAULT_ITERATIONS};
use crate::runner::{AgentRunner, RunnerConfig};
use crate::scoring::Thresholds;

pub const DEFAULT_CONFIG_FILE: &str = "judge-forge.yaml";
pub const DEFAULT_OUTPUT_DIR: &str = ".judge-forge";

/// Where agent commands run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnvironmentConfig {
    Local {
        #[serde(default)]
        preserve_uncommitted: bool,
    },
    Container(ContainerConfig),
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig::Local {
            preserve_uncommitted: false,
        }
    }
}

impl EnvironmentConfig {
    pub fn build(&self) -> Result<Arc<dyn Environment>, ConfigError> {
        Ok(match self {
            EnvironmentConfig::Local {
                preserve_uncommitted,
            } => {
                let mode = if *preserve_uncommitted {
                    IsolationMode::PreserveUncommitted
                } else {
                    IsolationMode::Clean
                };
                Arc::new(LocalEnvironment::new(mode))
            }
            EnvironmentConfig::Container(config) => {
                Arc::new(ContainerEnvironment::new(config.clone())?)
            }
        })
    }
}

/// Which judge scores outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JudgeConfig {
    Model(ProviderConfig),
    Cli {
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl JudgeConfig {
    /// `provider/model` for model judges.
    pub fn model_identity(&self) -> Option<String> {
        match self {
            JudgeConfig::Model(provider) => Some(provider.identity()),
            JudgeConfig::Cli { .. } => None,
        }
    }

    /// Builds the judge; CLI judges run their command from `workdir`.
    pub fn build(&self, workdir: &Path) -> Result<Arc<dyn Judge>, ConfigError> {
        Ok(match self {
            JudgeConfig::Model(provider) => {
                let client = ChatClient::from_config(provider)?;
                let capability = ModelCapability::new(Arc::new(client));
                Arc::new(ModelJudge::new(
                    capability,
                    &provider.provider,
                    provider.model.clone(),
                ))
            }
            JudgeConfig::Cli {
                command,
                timeout_ms,
            } => {
                let mut judge = CliJudge::new(command).with_workdir(workdir);
                if let Some(ms) = timeout_ms {
                    judge = judge.with_timeout(Duration::from_millis(*ms));
                }
                Arc::new(judge)
            }
        })
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Ledger directory, relative to the project root.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub ledger: LedgerBackend,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
    pub judge: JudgeConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Reject a judge that shares provider and model with an API runner.
    #[serde(default)]
    pub require_distinct_judge: bool,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub agent_timeout_ms: Option<u64>,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    /// Suite files or directories loaded when none are given on the command line.
    #[serde(default)]
    pub suites: Vec<PathBuf>,
}

impl HarnessConfig {
    /// Minimal configuration with the given judge.
    pub fn new(judge: JudgeConfig) -> Self {
        Self {
            output_dir: default_output_dir(),
            ledger: LedgerBackend::default(),
            environment: EnvironmentConfig::default(),
            runners: Vec::new(),
            judge,
            thresholds: Thresholds::default(),
            require_distinct_judge: false,
            iterations: DEFAULT_ITERATIONS,
            agent_timeout_ms: None,
            command_timeout_ms: None,
            suites: Vec::new(),
        }
    }

    pub fn from_yaml(yaml: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Reads, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&content, &path.display().to_string())?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("JUDGE_FORGE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("JUDGE_FORGE_LEDGER") {
            self.ledger = match val.trim().to_ascii_lowercase().as_str() {
                "jsonl" => LedgerBackend::Jsonl,
                "sqlite" => LedgerBackend::Sqlite,
                other => {
                    return Err(ValidationError::Config(format!(
                        "JUDGE_FORGE_LEDGER must be jsonl or sqlite, got '{other}'"
                    ))
                    .into())
                }
            };
        }
        if let Ok(val) = std::env::var("JUDGE_FORGE_ITERATIONS") {
            self.iterations = val.trim().parse().map_err(|_| {
                ValidationError::Config(format!(
                    "JUDGE_FORGE_ITERATIONS must be a positive integer, got '{val}'"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ValidationError::Config(msg.to_string()).into())
        };

        self.thresholds.validate()?;
        if self.iterations == 0 {
            return invalid("iterations must be greater than 0");
        }
        if self.agent_timeout_ms == Some(0) || self.command_timeout_ms == Some(0) {
            return invalid("timeouts must be greater than 0");
        }
        if self.output_dir.as_os_str().is_empty() {
            return invalid("output_dir cannot be empty");
        }

        let mut names = HashSet::new();
        for runner in &self.runners {
            if runner.name.trim().is_empty() {
                return invalid("runner name cannot be empty");
            }
            if !names.insert(runner.name.as_str()) {
                return Err(ValidationError::Config(format!(
                    "duplicate runner name '{}'",
                    runner.name
                ))
                .into());
            }
        }

        match &self.judge {
            JudgeConfig::Model(provider) if provider.model.trim().is_empty() => {
                return invalid("judge model cannot be empty");
            }
            JudgeConfig::Cli { command, .. } if command.trim().is_empty() => {
                return invalid("judge command cannot be empty");
            }
            _ => {}
        }

        if let Some(judge) = self.judge.model_identity() {
            for runner in &self.runners {
                if runner.model_identity().as_deref() == Some(judge.as_str()) {
                    if self.require_distinct_judge {
                        return Err(ValidationError::Config(format!(
                            "judge '{}' is the same model as runner '{}'",
                            judge, runner.name
                        ))
                        .into());
                    }
                    warn!(
                        judge = %judge,
                        runner = %runner.name,
                        "Judge shares provider and model with a runner; scores may be biased"
                    );
                }
            }
        }
        Ok(())
    }

    /// Ledger directory for a project rooted at `project_root`.
    pub fn ledger_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.output_dir)
    }

    pub fn runner(&self, name: Option<&str>) -> Result<&RunnerConfig, ConfigError> {
        match name {
            Some(name) => self
                .runners
                .iter()
                .find(|r| r.name == name)
                .ok_or_else(|| ConfigError::UnknownRunner(name.to_string())),
            None => self.runners.first().ok_or_else(|| {
                ValidationError::Config("no runners are configured".to_string()).into()
            }),
        }
    }

    pub fn build_runner(&self, name: Option<&str>) -> Result<Arc<dyn AgentRunner>, ConfigError> {
        self.runner(name)?.build()
    }

    pub fn judge_context(&self, project_root: &Path) -> Result<JudgeContext, ConfigError> {
        let judge = self.judge.build(project_root)?;
        Ok(JudgeContext::new(judge).with_thresholds(self.thresholds))
    }

    pub async fn open_ledger(&self, project_root: &Path) -> Result<Arc<dyn Ledger>, ConfigError> {
        Ok(ledger::open(self.ledger, &self.ledger_dir(project_root)).await?)
    }

    /// Wires environment, runner, judge and ledger into an orchestrator.
    pub async fn orchestrator(
        &self,
        project_root: &Path,
        runner: Option<&str>,
    ) -> Result<Orchestrator, ConfigError> {
        let environment = self.environment.build()?;
        let runner = self.build_runner(runner)?;
        let judge = self.judge_context(project_root)?;
        let ledger = self.open_ledger(project_root).await?;

        let mut orchestrator = Orchestrator::new(environment, runner, judge, ledger, project_root)
            .with_iterations(self.iterations);
        if let Some(ms) = self.agent_timeout_ms {
            orchestrator = orchestrator.with_agent_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.command_timeout_ms {
            orchestrator = orchestrator.with_command_timeout(Duration::from_millis(ms));
        }
        Ok(orchestrator)
    }
}
