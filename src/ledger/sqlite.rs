//! SQLite ledger (WAL journal, tracked migrations).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::aggregate::validate_override;
use super::migrations::MigrationRunner;
use super::types::{
    format_timestamp, now, parse_timestamp, LedgerEntry, RunRecord, RunnerStats, ScoreOverride,
};
use super::Ledger;
use crate::error::{LedgerError, ValidationError};
use crate::scoring::Status;

pub const DATABASE_FILE: &str = "ledger.sqlite";

const RUN_COLUMNS: &str = "id, test_id, timestamp, runner, judge_model, score, pass, reason, \
improvement, status, iteration, context, duration_ms, suite_path, thresholds";

pub struct SqliteLedger {
    dir: PathBuf,
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn open(dir: &Path) -> Result<Self, LedgerError> {
        super::prepare_dir(dir).await?;
        let options = SqliteConnectOptions::new()
            .filename(dir.join(DATABASE_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        MigrationRunner::new(pool.clone()).run_migrations().await?;
        debug!(dir = %dir.display(), "Opened SQLite ledger");

        Ok(Self {
            dir: dir.to_path_buf(),
            pool,
        })
    }

    /// Opens an existing database without creating it or applying
    /// migrations. The schema is still checked.
    pub async fn open_read_only(dir: &Path) -> Result<Self, LedgerError> {
        let path = dir.join(DATABASE_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Err(LedgerError::NotFound(path.display().to_string()));
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        MigrationRunner::new(pool.clone()).verify_schema().await?;
        debug!(dir = %dir.display(), "Opened SQLite ledger read-only");

        Ok(Self {
            dir: dir.to_path_buf(),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn corrupt(table: &str, id: i64, message: impl ToString) -> LedgerError {
    LedgerError::Corrupt {
        file: format!("{DATABASE_FILE}:{table}"),
        line: id.max(0) as usize,
        message: message.to_string(),
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let id: i64 = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let status: String = row.try_get("status")?;
    let context: String = row.try_get("context")?;
    let suite_path: Option<String> = row.try_get("suite_path")?;
    let thresholds: Option<String> = row.try_get("thresholds")?;

    Ok(LedgerEntry {
        id: id as u64,
        timestamp: parse_timestamp(&timestamp).map_err(|e| corrupt("runs", id, e))?,
        record: RunRecord {
            test_id: row.try_get("test_id")?,
            runner: row.try_get("runner")?,
            judge_model: row.try_get("judge_model")?,
            score: row.try_get("score")?,
            pass: row.try_get("pass")?,
            reason: row.try_get("reason")?,
            improvement: row.try_get("improvement")?,
            status: Status::from_str(&status).map_err(|e| corrupt("runs", id, e))?,
            iteration: row.try_get::<i64, _>("iteration")? as u32,
            context: serde_json::from_str(&context)?,
            duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
            suite_path: suite_path.map(|s| serde_json::from_str(&s)).transpose()?,
            thresholds: thresholds.map(|s| serde_json::from_str(&s)).transpose()?,
        },
    })
}

fn override_from_row(row: &SqliteRow) -> Result<ScoreOverride, LedgerError> {
    let id: i64 = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(ScoreOverride {
        id: id as u64,
        run_id: row.try_get::<i64, _>("run_id")? as u64,
        score: row.try_get("score")?,
        pass: row.try_get("pass")?,
        reason: row.try_get("reason")?,
        timestamp: parse_timestamp(&timestamp).map_err(|e| corrupt("overrides", id, e))?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    fn location(&self) -> &Path {
        &self.dir
    }

    async fn record_run(&self, record: RunRecord) -> Result<LedgerEntry, LedgerError> {
        let timestamp = now();
        let context = serde_json::to_string(&record.context)?;
        let suite_path = record
            .suite_path
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let thresholds = record
            .thresholds
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO runs (
                test_id, timestamp, runner, judge_model, score, pass, reason,
                improvement, status, iteration, context, duration_ms, suite_path, thresholds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.test_id)
        .bind(format_timestamp(&timestamp))
        .bind(&record.runner)
        .bind(&record.judge_model)
        .bind(record.score)
        .bind(record.pass)
        .bind(&record.reason)
        .bind(&record.improvement)
        .bind(record.status.to_string())
        .bind(record.iteration as i64)
        .bind(&context)
        .bind(record.duration_ms as i64)
        .bind(&suite_path)
        .bind(&thresholds)
        .execute(&self.pool)
        .await?;

        let entry = LedgerEntry {
            id: result.last_insert_rowid() as u64,
            timestamp,
            record,
        };
        debug!(run_id = entry.id, test_id = %entry.record.test_id, "Recorded run");
        Ok(entry)
    }

    async fn list_runs(&self, test_id: Option<&str>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = match test_id {
            Some(test_id) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE test_id = ? ORDER BY id"
                ))
                .bind(test_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(entry_from_row).collect()
    }

    async fn get_run(&self, id: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_test_ids(&self) -> Result<Vec<String>, LedgerError> {
        let rows = sqlx::query("SELECT DISTINCT test_id FROM runs ORDER BY test_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("test_id").map_err(LedgerError::from))
            .collect()
    }

    async fn override_run_score(
        &self,
        run_id: u64,
        score: f64,
        reason: &str,
    ) -> Result<ScoreOverride, LedgerError> {
        validate_override(score, reason)?;
        let run = self
            .get_run(run_id)
            .await?
            .ok_or(ValidationError::UnknownRun(run_id))?;

        let timestamp = now();
        let pass = run.thresholds().passes(score);
        let reason = reason.trim().to_string();

        let result = sqlx::query(
            "INSERT INTO overrides (run_id, score, pass, reason, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id as i64)
        .bind(score)
        .bind(pass)
        .bind(&reason)
        .bind(format_timestamp(&timestamp))
        .execute(&self.pool)
        .await?;

        let record = ScoreOverride {
            id: result.last_insert_rowid() as u64,
            run_id,
            score,
            pass,
            reason,
            timestamp,
        };
        debug!(override_id = record.id, run_id = run_id, score = score, "Recorded override");
        Ok(record)
    }

    async fn overrides_for(&self, run_id: u64) -> Result<Vec<ScoreOverride>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, run_id, score, pass, reason, timestamp FROM overrides WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(override_from_row).collect()
    }

    async fn all_overrides(&self) -> Result<Vec<ScoreOverride>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, run_id, score, pass, reason, timestamp FROM overrides ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(override_from_row).collect()
    }

    async fn latest_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH ranked AS (
                SELECT {RUN_COLUMNS},
                       ROW_NUMBER() OVER (
                           PARTITION BY test_id ORDER BY timestamp DESC, id DESC
                       ) AS rn
                FROM runs
            )
            SELECT {RUN_COLUMNS} FROM ranked WHERE rn = 1 ORDER BY test_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn runner_stats(&self) -> Result<Vec<RunnerStats>, LedgerError> {
        let rows = sqlx::query(
            r#"
            WITH latest_override AS (
                SELECT run_id, score, pass,
                       ROW_NUMBER() OVER (
                           PARTITION BY run_id ORDER BY timestamp DESC, id DESC
                       ) AS rn
                FROM overrides
            ),
            effective AS (
                SELECT r.runner AS runner,
                       COALESCE(o.score, r.score) AS score,
                       COALESCE(o.pass, r.pass) AS pass
                FROM runs r
                LEFT JOIN latest_override o ON o.run_id = r.id AND o.rn = 1
            )
            SELECT runner,
                   COUNT(*) AS total_runs,
                   AVG(score) AS average_score,
                   AVG(CASE WHEN pass THEN 1.0 ELSE 0.0 END) AS pass_rate
            FROM effective
            GROUP BY runner
            ORDER BY runner
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, LedgerError>(RunnerStats {
                    runner: row.try_get("runner")?,
                    total_runs: row.try_get::<i64, _>("total_runs")? as u64,
                    average_score: row.try_get("average_score")?,
                    pass_rate: row.try_get("pass_rate")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::aggregate::fixtures::record;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = SqliteLedger::open(dir.path()).await.unwrap();
            ledger.record_run(record("a", "r", 0.4)).await.unwrap();
        }
        let ledger = SqliteLedger::open(dir.path()).await.unwrap();
        let applied = MigrationRunner::new(ledger.pool().clone())
            .applied_migrations()
            .await
            .unwrap();
        assert_eq!(applied.len(), super::super::schema::migrations().len());
        assert_eq!(ledger.list_runs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join(DATABASE_FILE))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE runs (id INTEGER PRIMARY KEY, test_id TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let err = SqliteLedger::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, LedgerError::Migration(_)));
    }
}
