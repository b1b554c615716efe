//! Command-line interface for judge-forge.
//!
//! Provides the `run` command plus ledger inspection and override commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
