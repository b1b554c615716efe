//! Behaviour shared by the JSONL and SQLite ledgers.

use std::io::Write;
use std::sync::Arc;

use judge_forge::context::{CommandResult, ContextSnapshot};
use judge_forge::error::{LedgerError, ValidationError};
use judge_forge::ledger::jsonl::RUNS_FILE;
use judge_forge::ledger::{self, types, Ledger, LedgerBackend, LedgerEntry, RunRecord};
use judge_forge::scoring::{Status, Thresholds};
use tempfile::TempDir;

async fn backends() -> Vec<(TempDir, Arc<dyn Ledger>)> {
    let mut out = Vec::new();
    for backend in [LedgerBackend::Jsonl, LedgerBackend::Sqlite] {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger::open(backend, &dir.path().join("out")).await.unwrap();
        out.push((dir, ledger));
    }
    out
}

fn record(test_id: &str, runner: &str, score: f64) -> RunRecord {
    let thresholds = Thresholds::default();
    RunRecord {
        test_id: test_id.to_string(),
        runner: runner.to_string(),
        judge_model: "anthropic/claude-sonnet".to_string(),
        score,
        pass: thresholds.passes(score),
        reason: format!("scored {score}"),
        improvement: String::new(),
        status: thresholds.status(score),
        iteration: 1,
        context: ContextSnapshot {
            diff: Some("+added\n".to_string()),
            commands: vec![CommandResult {
                name: "tests".to_string(),
                command: "cargo test".to_string(),
                stdout: "ok\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 12,
            }],
        },
        duration_ms: 250,
        suite_path: None,
        thresholds: Some(thresholds),
    }
}

fn in_suite(mut record: RunRecord, path: &[&str]) -> RunRecord {
    record.suite_path = Some(path.iter().map(|s| s.to_string()).collect());
    record
}

#[tokio::test]
async fn test_records_round_trip() {
    for (_dir, ledger) in backends().await {
        let first = ledger.record_run(record("a", "claude", 0.9)).await.unwrap();
        let second = ledger.record_run(record("b", "codex", 0.4)).await.unwrap();
        assert!(second.id > first.id);

        let stored = ledger.get_run(first.id).await.unwrap().unwrap();
        assert_eq!(stored, first);
        assert_eq!(stored.record.context.commands[0].stdout, "ok\n");

        let all = ledger.list_runs(None).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), [first.id, second.id]);
        assert_eq!(ledger.list_runs(Some("b")).await.unwrap(), vec![second]);
        assert_eq!(ledger.list_test_ids().await.unwrap(), ["a", "b"]);
        assert!(ledger.get_run(999).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_ledger_directory_is_git_ignored() {
    for (dir, _ledger) in backends().await {
        let ignore = std::fs::read_to_string(dir.path().join("out/.gitignore")).unwrap();
        assert_eq!(ignore, "*\n");
    }
}

#[tokio::test]
async fn test_latest_entries_picks_newest_per_test() {
    for (_dir, ledger) in backends().await {
        ledger.record_run(record("a", "claude", 0.2)).await.unwrap();
        ledger.record_run(record("b", "claude", 0.5)).await.unwrap();
        let newest = ledger.record_run(record("a", "claude", 0.8)).await.unwrap();

        let latest = ledger.latest_entries().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].id, newest.id);
        assert_eq!(latest[1].test_id(), "b");
    }
}

#[tokio::test]
async fn test_invalid_overrides_append_nothing() {
    for (_dir, ledger) in backends().await {
        let run = ledger.record_run(record("a", "claude", 0.3)).await.unwrap();

        let err = ledger.override_run_score(run.id, 1.5, "too high").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Validation(ValidationError::ScoreOutOfRange(_))
        ));
        let err = ledger.override_run_score(run.id, 0.9, "   ").await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(ValidationError::EmptyReason)));
        let err = ledger.override_run_score(run.id + 100, 0.9, "missing").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Validation(ValidationError::UnknownRun(_))
        ));

        assert!(ledger.all_overrides().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_overrides_apply_latest_and_leave_the_run_alone() {
    for (_dir, ledger) in backends().await {
        let run = ledger.record_run(record("a", "claude", 0.3)).await.unwrap();

        let first = ledger
            .override_run_score(run.id, 0.6, "partial credit")
            .await
            .unwrap();
        let second = ledger
            .override_run_score(run.id, 0.95, "judge missed the tests")
            .await
            .unwrap();
        assert!(!first.pass);
        assert!(second.pass);

        let history = ledger.overrides_for(run.id).await.unwrap();
        assert_eq!(
            history.iter().map(|o| o.id).collect::<Vec<_>>(),
            [first.id, second.id]
        );

        let effective = ledger.effective(&run).await.unwrap();
        assert_eq!(effective.score, 0.95);
        assert!(effective.pass);
        assert_eq!(effective.status, Status::Pass);
        assert_eq!(effective.override_id, Some(second.id));

        // The original run keeps its judged score.
        let stored = ledger.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.record.score, 0.3);
        assert_eq!(stored.record.status, Status::Fail);
    }
}

#[tokio::test]
async fn test_runner_stats_use_effective_scores() {
    for (_dir, ledger) in backends().await {
        let low = ledger.record_run(record("a", "claude", 0.2)).await.unwrap();
        ledger.record_run(record("b", "claude", 0.8)).await.unwrap();
        ledger.record_run(record("a", "codex", 0.6)).await.unwrap();
        ledger.override_run_score(low.id, 1.0, "manual review").await.unwrap();

        let stats = ledger.runner_stats().await.unwrap();
        assert_eq!(stats.len(), 2);

        assert_eq!(stats[0].runner, "claude");
        assert_eq!(stats[0].total_runs, 2);
        assert!((stats[0].average_score - 0.9).abs() < 1e-9);
        assert_eq!(stats[0].pass_rate, 1.0);

        assert_eq!(stats[1].runner, "codex");
        assert_eq!(stats[1].total_runs, 1);
        assert_eq!(stats[1].pass_rate, 0.0);
    }
}

#[tokio::test]
async fn test_suite_tree_groups_latest_runs() {
    for (_dir, ledger) in backends().await {
        ledger
            .record_run(in_suite(record("api > lists users", "claude", 0.9), &["api"]))
            .await
            .unwrap();
        ledger
            .record_run(in_suite(
                record("api > auth > rejects bad tokens", "claude", 0.9),
                &["api", "auth"],
            ))
            .await
            .unwrap();
        ledger.record_run(record("standalone", "claude", 0.9)).await.unwrap();

        let tree = ledger.suite_tree().await.unwrap();
        assert_eq!(tree.tests, ["standalone"]);
        let api = &tree.children["api"];
        assert_eq!(api.tests, ["api > lists users"]);
        assert_eq!(api.children["auth"].tests, ["api > auth > rejects bad tokens"]);
    }
}

#[tokio::test]
async fn test_reopen_continues_ids() {
    for backend in [LedgerBackend::Jsonl, LedgerBackend::Sqlite] {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let ledger = ledger::open(backend, dir.path()).await.unwrap();
            ledger.record_run(record("a", "claude", 0.9)).await.unwrap()
        };
        let ledger = ledger::open(backend, dir.path()).await.unwrap();
        let second = ledger.record_run(record("a", "claude", 0.9)).await.unwrap();
        assert_eq!(second.id, first.id + 1);
        assert_eq!(ledger.list_runs(None).await.unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_reader_during_append_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ledger::open(LedgerBackend::Jsonl, dir.path()).await.unwrap();
    writer.record_run(record("a", "claude", 0.9)).await.unwrap();

    // A second record whose append is still in flight.
    let entry = LedgerEntry {
        id: 2,
        timestamp: types::now(),
        record: record("b", "claude", 0.4),
    };
    let mut line = serde_json::to_string(&entry).unwrap();
    line.push('\n');
    let (head, tail) = line.split_at(20);

    let path = dir.path().join(RUNS_FILE);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(head.as_bytes()).unwrap();
    let before = std::fs::metadata(&path).unwrap().len();

    let reader = ledger::open_read_only(LedgerBackend::Jsonl, dir.path())
        .await
        .unwrap();
    assert_eq!(reader.list_runs(None).await.unwrap().len(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), before);

    file.write_all(tail.as_bytes()).unwrap();
    drop(file);

    let runs = writer.list_runs(None).await.unwrap();
    assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), [1, 2]);
    assert_eq!(reader.list_runs(None).await.unwrap(), runs);
}

#[tokio::test]
async fn test_read_only_open_creates_nothing() {
    for backend in [LedgerBackend::Jsonl, LedgerBackend::Sqlite] {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("out");
        let err = ledger::open_read_only(backend, &missing).await.err().unwrap();
        assert!(matches!(err, LedgerError::NotFound(_)), "{backend:?}: {err}");
        assert!(!missing.exists());
    }
}

#[tokio::test]
async fn test_read_only_ledgers_query_but_do_not_append() {
    for backend in [LedgerBackend::Jsonl, LedgerBackend::Sqlite] {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = ledger::open(backend, dir.path()).await.unwrap();
            writer.record_run(record("a", "claude", 0.9)).await.unwrap();
        }
        let reader = ledger::open_read_only(backend, dir.path()).await.unwrap();
        assert_eq!(reader.list_runs(None).await.unwrap().len(), 1);
        assert_eq!(reader.latest_entries().await.unwrap().len(), 1);
        assert!(reader.record_run(record("b", "claude", 0.9)).await.is_err());
        assert_eq!(reader.list_runs(None).await.unwrap().len(), 1);
    }
}
