//! SQLite schema for the ledger.

/// Run records. JSON-valued columns hold serialized evidence and settings.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    runner TEXT NOT NULL,
    judge_model TEXT NOT NULL,
    score REAL NOT NULL,
    pass INTEGER NOT NULL,
    reason TEXT NOT NULL,
    improvement TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    context TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    suite_path TEXT,
    thresholds TEXT
)
"#;

/// Score overrides, append-only.
pub const CREATE_OVERRIDES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS overrides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    score REAL NOT NULL,
    pass INTEGER NOT NULL,
    reason TEXT NOT NULL,
    timestamp TEXT NOT NULL
)
"#;

pub const CREATE_RUNS_TEST_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_test_id ON runs(test_id, timestamp, id)";

pub const CREATE_RUNS_RUNNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_runner ON runs(runner)";

pub const CREATE_OVERRIDES_RUN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_overrides_run_id ON overrides(run_id, timestamp, id)";

/// Columns every `runs` table must have; anything missing is a schema mismatch.
pub const RUNS_COLUMNS: &[&str] = &[
    "id",
    "test_id",
    "timestamp",
    "runner",
    "judge_model",
    "score",
    "pass",
    "reason",
    "improvement",
    "status",
    "iteration",
    "context",
    "duration_ms",
    "suite_path",
    "thresholds",
];

pub const OVERRIDES_COLUMNS: &[&str] = &["id", "run_id", "score", "pass", "reason", "timestamp"];

/// Versioned migrations, applied in order and recorded by name.
pub fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        ("0001_create_runs", CREATE_RUNS_TABLE),
        ("0002_create_overrides", CREATE_OVERRIDES_TABLE),
        ("0003_index_runs_test_id", CREATE_RUNS_TEST_INDEX),
        ("0004_index_runs_runner", CREATE_RUNS_RUNNER_INDEX),
        ("0005_index_overrides_run_id", CREATE_OVERRIDES_RUN_INDEX),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_names_are_unique_and_ordered() {
        let names: Vec<&str> = migrations().iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_tables_declare_expected_columns() {
        for column in RUNS_COLUMNS {
            assert!(CREATE_RUNS_TABLE.contains(&format!("    {column} ")), "{column}");
        }
        for column in OVERRIDES_COLUMNS {
            assert!(CREATE_OVERRIDES_TABLE.contains(&format!("    {column} ")), "{column}");
        }
    }
}
