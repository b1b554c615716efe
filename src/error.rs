//! Error types for judge-forge operations.
//!
//! Each pluggable subsystem has its own error enum:
//! - Environment setup/teardown (local git, containers)
//! - Agent runners
//! - LLM transport
//! - Judges
//! - Ledger storage
//! - Validation of user-supplied values
//!
//! [`EvalError`] is the taxonomy a test body and the orchestrator deal in. It
//! keeps "the harness broke" apart from "the agent's work was judged
//! insufficient".

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::Status;

/// Errors raised while preparing or tearing down a workspace.
///
/// Command failures are never reported through this type; they are captured
/// as [`crate::environment::ExecOutput`] values.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Workspace '{0}' is not a git repository")]
    NotAGitRepository(PathBuf),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Diff capture failed: {0}")]
    Diff(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{provider}': set {env_var} or configure api_key")]
    MissingApiKey { provider: String, env_var: String },

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors from agent runners.
///
/// A non-zero agent exit is not an error; see [`crate::runner::RunnerOutput`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Model call failed: {0}")]
    Model(#[from] LlmError),

    #[error("Model returned an invalid file set: {0}")]
    InvalidResponse(String),

    #[error("Refusing to write outside the workspace: {0}")]
    UnsafePath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from judges. All of these are infrastructure failures: a verdict
/// that merely fails the criteria is a [`JudgeFailure`], not a `JudgeError`.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Judge transport failed: {0}")]
    Transport(#[from] LlmError),

    #[error("Judge response failed schema validation: {0}")]
    InvalidResponse(String),

    #[error("Judge command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("Judge timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to render judge prompt: {0}")]
    Template(#[from] tera::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised synchronously, before any side effect, for malformed input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("Override reason must not be empty")]
    EmptyReason,

    #[error("Invalid thresholds: warn ({warn}) must be <= pass ({pass}), both within [0, 1]")]
    InvalidThresholds { pass: f64, warn: f64 },

    #[error("Weight for '{name}' must be a positive finite number, got {weight}")]
    InvalidWeight { name: String, weight: f64 },

    #[error("Run {0} does not exist")]
    UnknownRun(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("No ledger found at {0}")]
    NotFound(String),

    #[error("Ledger was opened read-only")]
    ReadOnly,

    #[error("Corrupt ledger record at {file}:{line}: {message}")]
    Corrupt {
        file: String,
        line: usize,
        message: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors that can occur while loading configuration or suite files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Runner '{0}' is not defined in the configuration")]
    UnknownRunner(String),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Pipeline stage names, used to tag where an iteration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    EnvSetup,
    AgentExecute,
    EvidenceCapture,
    Verify,
    Judge,
    Score,
    Persist,
    Teardown,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::EnvSetup => "env_setup",
            Stage::AgentExecute => "agent_execute",
            Stage::EvidenceCapture => "evidence_capture",
            Stage::Verify => "verify",
            Stage::Judge => "judge",
            Stage::Score => "score",
            Stage::Persist => "persist",
            Stage::Teardown => "teardown",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A valid verdict that did not meet the criteria.
///
/// Raised only after the ledger entry for the verdict has been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeFailure {
    pub test_id: String,
    /// Ledger id of the recorded run.
    pub run_id: u64,
    pub score: f64,
    pub status: Status,
    pub reason: String,
    pub improvement: String,
}

impl fmt::Display for JudgeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Judge failed '{}' (run #{}): score {:.2} [{}]\nReason: {}",
            self.test_id, self.run_id, self.score, self.status, self.reason
        )?;
        if !self.improvement.trim().is_empty() {
            write!(f, "\nImprovement: {}", self.improvement)?;
        }
        Ok(())
    }
}

impl std::error::Error for JudgeFailure {}

/// Outcome taxonomy for a test body and a pipeline iteration.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Environment, runner transport or judge transport/parsing failure.
    #[error("Infrastructure error during {stage}: {message}")]
    Infrastructure { stage: Stage, message: String },

    /// The judge scored the work below the passing threshold.
    #[error(transparent)]
    Judge(#[from] JudgeFailure),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An assertion raised by the test body itself.
    #[error("Test failed: {0}")]
    Test(String),
}

impl EvalError {
    pub fn infrastructure(stage: Stage, err: impl fmt::Display) -> Self {
        EvalError::Infrastructure {
            stage,
            message: err.to_string(),
        }
    }

    pub fn is_judge_failure(&self) -> bool {
        matches!(self, EvalError::Judge(_))
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, EvalError::Infrastructure { .. })
    }
}
