//! Tracked schema migrations for the SQLite ledger.

use sqlx::{Row, SqlitePool};
use tracing::info;

use super::schema;
use super::types::{format_timestamp, now};
use crate::error::LedgerError;

/// Applies pending migrations and verifies the resulting schema.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        self.ensure_migrations_table().await?;

        for (name, statement) in schema::migrations() {
            if !self.is_migration_applied(name).await? {
                self.apply_migration(name, statement).await?;
                info!(migration = name, "Applied ledger migration");
            }
        }

        self.verify_schema().await
    }

    /// Checks that both ledger tables carry every expected column.
    pub async fn verify_schema(&self) -> Result<(), LedgerError> {
        self.verify_columns("runs", schema::RUNS_COLUMNS).await?;
        self.verify_columns("overrides", schema::OVERRIDES_COLUMNS).await
    }

    async fn ensure_migrations_table(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, LedgerError> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(result.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Migration(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(format_timestamp(&now()))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Names of applied migrations, in application order.
    pub async fn applied_migrations(&self) -> Result<Vec<String>, LedgerError> {
        self.ensure_migrations_table().await?;
        let rows = sqlx::query("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    async fn verify_columns(&self, table: &str, expected: &[&str]) -> Result<(), LedgerError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;
        let present: Vec<String> = rows.iter().map(|row| row.get::<String, _>("name")).collect();

        let missing: Vec<&str> = expected
            .iter()
            .copied()
            .filter(|column| !present.iter().any(|p| p == column))
            .collect();
        if !missing.is_empty() {
            return Err(LedgerError::Migration(format!(
                "schema mismatch: table '{}' is missing columns {:?}",
                table, missing
            )));
        }
        Ok(())
    }
}
