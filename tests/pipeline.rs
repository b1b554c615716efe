//! End-to-end iterations against real git workspaces.

mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{committed_repo, empty_repo, verdict, CountingEnvironment, FixedJudge};
use judge_forge::environment::{Environment, ExecOptions, LocalEnvironment, TIMEOUT_EXIT_CODE};
use judge_forge::error::{EvalError, Stage};
use judge_forge::judge::{CliJudge, Judge, JudgeContext};
use judge_forge::ledger::{self, Ledger, LedgerBackend};
use judge_forge::orchestrator::{JudgeTask, Orchestrator, Outcome};
use judge_forge::registry::TestRegistry;
use judge_forge::runner::{CliRunner, RunnerOutput};
use judge_forge::scoring::Status;

async fn orchestrator(
    root: &Path,
    environment: Arc<dyn Environment>,
    agent: &str,
    judge: Arc<dyn Judge>,
) -> (Orchestrator, Arc<dyn Ledger>) {
    let ledger = ledger::open(LedgerBackend::Jsonl, &root.join(".judge-forge"))
        .await
        .unwrap();
    let runner = Arc::new(CliRunner::new("shell", agent));
    let orchestrator = Orchestrator::new(
        environment,
        runner,
        JudgeContext::new(judge),
        Arc::clone(&ledger),
        root,
    );
    (orchestrator, ledger)
}

#[tokio::test]
async fn test_empty_repository_end_to_end() {
    let repo = empty_repo();
    let judge = FixedJudge::passing();
    let (orchestrator, ledger) = orchestrator(
        repo.path(),
        Arc::new(LocalEnvironment::clean()),
        "echo hello > hello.txt; : {{prompt}}",
        judge.clone(),
    )
    .await;

    let mut registry = TestRegistry::new();
    registry.describe("greetings", |suite| {
        suite.test("writes hello", |scope| async move {
            scope.agent("write hello.txt").await?;
            let diff = scope.store_diff().await?;
            if !diff.contains("hello.txt") {
                return Err(EvalError::Test(format!("unexpected diff: {diff}")));
            }
            scope.run_command("show", "cat hello.txt").await;
            scope
                .to_pass_judge("hello.txt contains a greeting", &["hello.txt".to_string()])
                .await?;
            Ok(())
        });
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    assert_eq!(report.tests[0].outcome, Outcome::Pass, "{:?}", report);
    assert_eq!(judge.calls(), 1);

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.record.test_id, "greetings > writes hello");
    assert_eq!(run.record.runner, "shell");
    assert_eq!(run.record.judge_model, "fixed");
    assert_eq!(run.record.status, Status::Pass);
    assert_eq!(run.record.suite_path, Some(vec!["greetings".to_string()]));
    assert_eq!(run.record.context.commands[0].stdout, "hello\n");
    let diff = run.record.context.diff.as_deref().unwrap();
    assert!(diff.contains("+hello"));
    assert!(!diff.contains(".judge-forge"), "ledger files leaked into the diff");

    let prompt = &judge.prompts.lock().unwrap()[0];
    assert!(prompt.contains("hello.txt: present"));
    assert!(prompt.contains("=== COMMAND: show ==="));
}

#[tokio::test]
async fn test_failing_cli_judge_records_before_failing() {
    let repo = committed_repo();
    let judge = Arc::new(CliJudge::new(
        r#"cat > /dev/null; echo '{"pass": false, "score": 0.2, "reason": "no tests were added", "improvement": "add a unit test"}'"#,
    ));
    let (orchestrator, ledger) = orchestrator(
        repo.path(),
        Arc::new(LocalEnvironment::clean()),
        "echo change >> README.md; : {{prompt}}",
        judge,
    )
    .await;

    let observed = Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&observed);
    let mut registry = TestRegistry::new();
    registry.test("adds tests", move |scope| {
        let seen = Arc::clone(&seen);
        async move {
            scope.agent("add tests").await?;
            scope.store_diff().await?;
            let result = scope.to_pass_judge("Unit tests exist", &[]).await;
            if let Err(EvalError::Judge(failure)) = &result {
                // The entry must already be readable when the failure surfaces.
                *seen.lock().unwrap() = Some(failure.run_id);
            }
            result.map(|_| ())
        }
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    let test = &report.tests[0];
    assert_eq!(test.outcome, Outcome::Fail);
    let message = test.iterations[0].message.as_deref().unwrap();
    assert!(message.contains("0.20"));
    assert!(message.contains("no tests were added"));
    assert!(message.contains("add a unit test"));

    let runs = ledger.list_runs(Some("adds tests")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].record.pass);
    assert_eq!(runs[0].record.status, Status::Fail);
    assert_eq!(*observed.lock().unwrap(), Some(runs[0].id));
    assert_eq!(test.iterations[0].run_ids, vec![runs[0].id]);
}

#[tokio::test]
async fn test_command_timeout_is_bounded() {
    let repo = committed_repo();
    let env = LocalEnvironment::clean();
    let started = Instant::now();
    let out = env
        .execute(
            "sleep 10",
            repo.path(),
            ExecOptions::with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(out.timed_out);
    assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
}

#[tokio::test]
async fn test_agent_timeout_does_not_abort_iteration() {
    let repo = committed_repo();
    let judge = FixedJudge::passing();
    let (orchestrator, ledger) = orchestrator(
        repo.path(),
        Arc::new(LocalEnvironment::clean()),
        "sleep 10; : {{prompt}}",
        judge.clone(),
    )
    .await;
    let orchestrator = orchestrator.with_agent_timeout(Duration::from_millis(100));

    let mut registry = TestRegistry::new();
    registry.test("slow agent", |scope| async move {
        match scope.agent("anything").await? {
            RunnerOutput::Process(out) if out.timed_out => {}
            other => return Err(EvalError::Test(format!("expected a timeout, got {other:?}"))),
        }
        scope.store_diff().await?;
        scope.to_pass_judge("anything", &[]).await?;
        Ok(())
    });

    let started = Instant::now();
    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.tests[0].outcome, Outcome::Pass, "{:?}", report);
    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_setup_failure_writes_nothing() {
    let not_a_repo = tempfile::tempdir().unwrap();
    let judge = FixedJudge::passing();
    let env = CountingEnvironment::new(LocalEnvironment::clean());
    let (orchestrator, ledger) =
        orchestrator(not_a_repo.path(), env.clone(), "true", judge.clone()).await;

    let mut registry = TestRegistry::new();
    registry.test("never runs", |scope| async move {
        scope.to_pass_judge("anything", &[]).await?;
        Ok(())
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    let iteration = &report.tests[0].iterations[0];
    assert_eq!(iteration.outcome, Outcome::Error);
    assert_eq!(iteration.stage, Some(Stage::EnvSetup));
    assert_eq!(judge.calls(), 0);
    assert_eq!(env.teardowns.load(Ordering::SeqCst), 0);
    assert!(ledger.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clean_isolation_discards_previous_changes() {
    let repo = committed_repo();
    std::fs::write(repo.path().join("README.md"), "edited\n").unwrap();
    std::fs::write(repo.path().join("stray.txt"), "left over\n").unwrap();

    let env = LocalEnvironment::clean();
    env.setup(repo.path()).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
        "# demo\n"
    );
    assert!(!repo.path().join("stray.txt").exists());
    assert_eq!(env.diff(repo.path()).await.unwrap(), "");
}

#[tokio::test]
async fn test_preserve_mode_restores_uncommitted_work() {
    let repo = committed_repo();
    std::fs::write(repo.path().join("README.md"), "# demo\nwork in progress\n").unwrap();
    std::fs::write(repo.path().join("notes.txt"), "draft\n").unwrap();

    let env = LocalEnvironment::preserving();
    env.setup(repo.path()).await.unwrap();
    std::fs::write(repo.path().join("agent.txt"), "agent output\n").unwrap();
    env.teardown(repo.path()).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
        "# demo\nwork in progress\n"
    );
    assert_eq!(
        std::fs::read_to_string(repo.path().join("notes.txt")).unwrap(),
        "draft\n"
    );
    assert!(!repo.path().join("agent.txt").exists());
}

#[tokio::test]
async fn test_preserve_mode_restores_non_utf8_bytes() {
    let repo = committed_repo();
    let readme: &[u8] = b"# demo\ncaf\xe9 au lait\n";
    let notes: &[u8] = b"na\xefve \xff\xfe draft\n";
    std::fs::write(repo.path().join("README.md"), readme).unwrap();
    std::fs::write(repo.path().join("latin1.txt"), notes).unwrap();

    let env = LocalEnvironment::preserving();
    env.setup(repo.path()).await.unwrap();
    std::fs::write(repo.path().join("README.md"), "agent rewrote this\n").unwrap();
    env.teardown(repo.path()).await.unwrap();

    assert_eq!(std::fs::read(repo.path().join("README.md")).unwrap(), readme);
    assert_eq!(std::fs::read(repo.path().join("latin1.txt")).unwrap(), notes);
}

#[tokio::test]
async fn test_diff_is_idempotent() {
    let repo = committed_repo();
    std::fs::write(repo.path().join("README.md"), "# changed\n").unwrap();
    std::fs::write(repo.path().join("b.txt"), "b\n").unwrap();
    std::fs::write(repo.path().join("a.txt"), "a\n").unwrap();

    let env = LocalEnvironment::clean();
    let first = env.diff(repo.path()).await.unwrap();
    let second = env.diff(repo.path()).await.unwrap();
    assert_eq!(first, second);
    let a = first.find("a.txt").unwrap();
    let b = first.find("b.txt").unwrap();
    assert!(a < b, "untracked files are diffed in path order");
}

#[tokio::test]
async fn test_iterations_teardown_and_panics() {
    let repo = committed_repo();
    let judge = FixedJudge::passing();
    let env = CountingEnvironment::new(LocalEnvironment::clean());
    let (orchestrator, ledger) = orchestrator(repo.path(), env.clone(), "true", judge).await;

    let mut registry = TestRegistry::new();
    registry
        .test("repeated", |scope| async move {
            scope.store_diff().await?;
            scope.to_pass_judge("anything", &[]).await?;
            Ok(())
        })
        .iterations(3);
    registry.test("panics", |scope| async move {
        if scope.iteration() > 0 {
            panic!("body blew up");
        }
        Ok(())
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    assert_eq!(report.tests[0].iterations.len(), 3);
    assert_eq!(report.tests[0].outcome, Outcome::Pass);
    assert_eq!(report.tests[1].outcome, Outcome::Fail);

    assert_eq!(env.setups.load(Ordering::SeqCst), 4);
    assert_eq!(env.teardowns.load(Ordering::SeqCst), 4);

    let iterations: Vec<u32> = ledger
        .list_runs(Some("repeated"))
        .await
        .unwrap()
        .iter()
        .map(|r| r.record.iteration)
        .collect();
    assert_eq!(iterations, [1, 2, 3]);
}

#[tokio::test]
async fn test_weighted_tasks_record_one_entry() {
    let repo = committed_repo();
    let judge = FixedJudge::new(vec![
        verdict(true, 1.0, "readme updated"),
        verdict(false, 0.4, "changelog missing"),
    ]);
    let (orchestrator, ledger) = orchestrator(
        repo.path(),
        Arc::new(LocalEnvironment::clean()),
        "true",
        judge.clone(),
    )
    .await;

    let mut registry = TestRegistry::new();
    registry.test("docs", |scope| async move {
        let tasks = [
            JudgeTask::new("readme", "README updated").with_weight(Some(3.0)),
            JudgeTask::new("changelog", "CHANGELOG updated"),
        ];
        scope.judge_tasks(&tasks, &[]).await?;
        Ok(())
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    assert_eq!(judge.calls(), 2);

    // (3 * 1.0 + 0.4) / 4 clears the pass line even though one task failed.
    assert_eq!(report.tests[0].outcome, Outcome::Pass, "{:?}", report);
    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!((runs[0].record.score - 0.85).abs() < 1e-9);
    assert!(runs[0].record.pass);
    assert_eq!(runs[0].record.status, Status::Pass);
    assert!(runs[0]
        .record
        .reason
        .contains("[changelog] fail 0.40: changelog missing"));
    assert!(runs[0].record.reason.contains("[readme] pass 1.00: readme updated"));
}

#[tokio::test]
async fn test_weighted_tasks_below_pass_line_fail() {
    let repo = committed_repo();
    let judge = FixedJudge::new(vec![
        verdict(true, 0.8, "readme updated"),
        verdict(false, 0.1, "changelog missing"),
    ]);
    let (orchestrator, ledger) = orchestrator(
        repo.path(),
        Arc::new(LocalEnvironment::clean()),
        "true",
        judge,
    )
    .await;

    let mut registry = TestRegistry::new();
    registry.test("docs", |scope| async move {
        let tasks = [
            JudgeTask::new("readme", "README updated"),
            JudgeTask::new("changelog", "CHANGELOG updated"),
        ];
        scope.judge_tasks(&tasks, &[]).await?;
        Ok(())
    });

    let report = orchestrator.run_all(&registry, &[]).await.unwrap();
    // (0.8 + 0.1) / 2 = 0.45 is below the warn line.
    assert_eq!(report.tests[0].outcome, Outcome::Fail);
    let runs = ledger.list_runs(None).await.unwrap();
    assert!(!runs[0].record.pass);
    assert_eq!(runs[0].record.status, Status::Fail);
}
