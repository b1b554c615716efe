//! judge-forge: evaluation harness for coding agents.
//!
//! A test prompts an agent inside an isolated workspace, captures the diff and
//! the output of verification commands, and asks a judge to score the result
//! against natural-language criteria. Every verdict is appended to a ledger
//! for comparison across agents and over time.
//!
//! The moving parts are traits selected by configuration:
//!
//! - [`environment::Environment`]: local git checkout or Docker container
//! - [`runner::AgentRunner`]: shell agent or model-backed file writer
//! - [`judge::Judge`]: language model or external command
//! - [`ledger::Ledger`]: JSONL files or SQLite
//!
//! [`orchestrator::Orchestrator`] drives registered tests through them.

pub mod cli;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod judge;
pub mod ledger;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod scoring;

pub use error::{
    ConfigError, EnvironmentError, EvalError, JudgeError, JudgeFailure, LedgerError, LlmError,
    RunnerError, Stage, ValidationError,
};
