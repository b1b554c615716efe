//! Durable run history.
//!
//! The ledger is append-only: run records and score overrides are added,
//! never edited or removed. Two backends share the [`Ledger`] trait:
//!
//! - [`JsonlLedger`]: `ledger.jsonl` and `overrides.jsonl`, one record per line.
//! - [`SqliteLedger`]: `ledger.sqlite` in WAL mode with tracked migrations.
//!
//! Reads never mutate. Overrides are layered on top of runs at read time
//! (see [`aggregate::effective`]).

pub mod aggregate;
pub mod jsonl;
pub mod migrations;
pub mod schema;
pub mod sqlite;
pub mod types;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub use jsonl::JsonlLedger;
pub use sqlite::SqliteLedger;
pub use types::{
    EffectiveResult, LedgerEntry, RunRecord, RunnerStats, ScoreOverride, SuiteNode,
};

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Jsonl,
    Sqlite,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Directory holding the ledger files.
    fn location(&self) -> &Path;

    /// Appends a run, assigning its id and timestamp.
    async fn record_run(&self, record: RunRecord) -> Result<LedgerEntry, LedgerError>;

    /// Runs in id order, optionally for one test.
    async fn list_runs(&self, test_id: Option<&str>) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn get_run(&self, id: u64) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Distinct test ids, sorted.
    async fn list_test_ids(&self) -> Result<Vec<String>, LedgerError>;

    /// Appends a score override for `run_id`.
    ///
    /// The score range, the reason and the run's existence are checked before
    /// anything is written. `pass` is derived from the run's thresholds.
    async fn override_run_score(
        &self,
        run_id: u64,
        score: f64,
        reason: &str,
    ) -> Result<ScoreOverride, LedgerError>;

    /// Overrides for one run, in append order.
    async fn overrides_for(&self, run_id: u64) -> Result<Vec<ScoreOverride>, LedgerError>;

    async fn all_overrides(&self) -> Result<Vec<ScoreOverride>, LedgerError>;

    /// Most recent run of every test.
    async fn latest_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let runs = self.list_runs(None).await?;
        Ok(aggregate::latest_per_test(&runs))
    }

    async fn suite_tree(&self) -> Result<SuiteNode, LedgerError> {
        let runs = self.list_runs(None).await?;
        Ok(aggregate::suite_tree(&runs))
    }

    async fn runner_stats(&self) -> Result<Vec<RunnerStats>, LedgerError> {
        let runs = self.list_runs(None).await?;
        let overrides = self.all_overrides().await?;
        Ok(aggregate::runner_stats(&runs, &overrides))
    }

    /// The run's score with its latest override applied.
    async fn effective(&self, run: &LedgerEntry) -> Result<EffectiveResult, LedgerError> {
        let overrides = self.overrides_for(run.id).await?;
        Ok(aggregate::effective(run, &overrides))
    }
}

/// Creates `dir` and marks it ignored, so git isolation (clean, diff, stash)
/// never touches ledger files living inside the workspace under test.
pub(crate) async fn prepare_dir(dir: &Path) -> Result<(), LedgerError> {
    tokio::fs::create_dir_all(dir).await?;
    let gitignore = dir.join(".gitignore");
    if !tokio::fs::try_exists(&gitignore).await? {
        tokio::fs::write(&gitignore, "*\n").await?;
    }
    Ok(())
}

/// Opens an existing ledger for queries. Nothing on disk is created or
/// modified; appends fail.
pub async fn open_read_only(
    backend: LedgerBackend,
    output_dir: &Path,
) -> Result<std::sync::Arc<dyn Ledger>, LedgerError> {
    Ok(match backend {
        LedgerBackend::Jsonl => std::sync::Arc::new(JsonlLedger::open_read_only(output_dir).await?),
        LedgerBackend::Sqlite => {
            std::sync::Arc::new(SqliteLedger::open_read_only(output_dir).await?)
        }
    })
}

/// Opens the configured backend under `output_dir`.
pub async fn open(
    backend: LedgerBackend,
    output_dir: &Path,
) -> Result<std::sync::Arc<dyn Ledger>, LedgerError> {
    Ok(match backend {
        LedgerBackend::Jsonl => std::sync::Arc::new(JsonlLedger::open(output_dir).await?),
        LedgerBackend::Sqlite => std::sync::Arc::new(SqliteLedger::open(output_dir).await?),
    })
}
