//! Line-delimited JSON ledger.
//!
//! Each record is serialized to one line and appended. A crash mid-write
//! leaves at most one partial trailing line. Readers skip it and never touch
//! the files; the writer drops it under its append lock before the next
//! append.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::aggregate::validate_override;
use super::types::{now, LedgerEntry, RunRecord, ScoreOverride};
use super::Ledger;
use crate::error::{LedgerError, ValidationError};

pub const RUNS_FILE: &str = "ledger.jsonl";
pub const OVERRIDES_FILE: &str = "overrides.jsonl";

#[derive(Debug)]
struct Counters {
    next_run_id: u64,
    next_override_id: u64,
}

pub struct JsonlLedger {
    dir: PathBuf,
    runs_path: PathBuf,
    overrides_path: PathBuf,
    /// Serializes appends and id assignment.
    counters: Mutex<Counters>,
    read_only: bool,
}

impl JsonlLedger {
    /// Opens the ledger for appending, creating `dir` if needed.
    pub async fn open(dir: &Path) -> Result<Self, LedgerError> {
        super::prepare_dir(dir).await?;
        Self::load(dir, false).await
    }

    /// Opens an existing ledger without creating or modifying anything.
    /// Appends on the returned ledger fail with [`LedgerError::ReadOnly`].
    pub async fn open_read_only(dir: &Path) -> Result<Self, LedgerError> {
        if !fs::try_exists(dir).await? {
            return Err(LedgerError::NotFound(dir.display().to_string()));
        }
        Self::load(dir, true).await
    }

    async fn load(dir: &Path, read_only: bool) -> Result<Self, LedgerError> {
        let runs_path = dir.join(RUNS_FILE);
        let overrides_path = dir.join(OVERRIDES_FILE);

        let runs: Vec<LedgerEntry> = read_records(&runs_path).await?;
        let overrides: Vec<ScoreOverride> = read_records(&overrides_path).await?;
        let counters = Counters {
            next_run_id: runs.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            next_override_id: overrides.iter().map(|o| o.id).max().unwrap_or(0) + 1,
        };
        debug!(
            dir = %dir.display(),
            runs = runs.len(),
            overrides = overrides.len(),
            read_only,
            "Opened JSONL ledger"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            runs_path,
            overrides_path,
            counters: Mutex::new(counters),
            read_only,
        })
    }

    fn ensure_writable(&self) -> Result<(), LedgerError> {
        if self.read_only {
            return Err(LedgerError::ReadOnly);
        }
        Ok(())
    }

    pub fn runs_path(&self) -> &Path {
        &self.runs_path
    }

    pub fn overrides_path(&self) -> &Path {
        &self.overrides_path
    }
}

/// Drops an unterminated final line left by an interrupted append.
///
/// Only the writer calls this, holding the append lock.
async fn repair_tail(path: &Path) -> Result<(), LedgerError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut content).await?;

    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    warn!(
        file = %path.display(),
        dropped_bytes = content.len() - keep,
        "Discarding partial trailing ledger line"
    );
    file.set_len(keep as u64).await?;
    Ok(())
}

async fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LedgerError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_lines(&content, path)
}

fn parse_lines<T: DeserializeOwned>(content: &str, path: &Path) -> Result<Vec<T>, LedgerError> {
    // Everything after the last newline is an incomplete write.
    let complete = match content.rfind('\n') {
        Some(i) => &content[..=i],
        None => "",
    };

    complete
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| LedgerError::Corrupt {
                file: path.display().to_string(),
                line: i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Appends one record. Callers hold the append lock.
async fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), LedgerError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    repair_tail(path).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Ledger for JsonlLedger {
    fn location(&self) -> &Path {
        &self.dir
    }

    async fn record_run(&self, record: RunRecord) -> Result<LedgerEntry, LedgerError> {
        self.ensure_writable()?;
        let mut counters = self.counters.lock().await;
        let entry = LedgerEntry {
            id: counters.next_run_id,
            timestamp: now(),
            record,
        };
        append_line(&self.runs_path, &entry).await?;
        counters.next_run_id += 1;
        debug!(run_id = entry.id, test_id = %entry.record.test_id, "Recorded run");
        Ok(entry)
    }

    async fn list_runs(&self, test_id: Option<&str>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut runs: Vec<LedgerEntry> = read_records(&self.runs_path).await?;
        if let Some(test_id) = test_id {
            runs.retain(|r| r.record.test_id == test_id);
        }
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn get_run(&self, id: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let runs: Vec<LedgerEntry> = read_records(&self.runs_path).await?;
        Ok(runs.into_iter().find(|r| r.id == id))
    }

    async fn list_test_ids(&self) -> Result<Vec<String>, LedgerError> {
        let runs: Vec<LedgerEntry> = read_records(&self.runs_path).await?;
        let mut ids: Vec<String> = runs.into_iter().map(|r| r.record.test_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn override_run_score(
        &self,
        run_id: u64,
        score: f64,
        reason: &str,
    ) -> Result<ScoreOverride, LedgerError> {
        self.ensure_writable()?;
        validate_override(score, reason)?;
        let run = self
            .get_run(run_id)
            .await?
            .ok_or(ValidationError::UnknownRun(run_id))?;

        let mut counters = self.counters.lock().await;
        let record = ScoreOverride {
            id: counters.next_override_id,
            run_id,
            score,
            pass: run.thresholds().passes(score),
            reason: reason.trim().to_string(),
            timestamp: now(),
        };
        append_line(&self.overrides_path, &record).await?;
        counters.next_override_id += 1;
        debug!(override_id = record.id, run_id = run_id, score = score, "Recorded override");
        Ok(record)
    }

    async fn overrides_for(&self, run_id: u64) -> Result<Vec<ScoreOverride>, LedgerError> {
        let mut overrides: Vec<ScoreOverride> = read_records(&self.overrides_path).await?;
        overrides.retain(|o| o.run_id == run_id);
        Ok(overrides)
    }

    async fn all_overrides(&self) -> Result<Vec<ScoreOverride>, LedgerError> {
        read_records(&self.overrides_path).await
    }
}
