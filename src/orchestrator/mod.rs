//! Test orchestrator.
//!
//! Drives each registered test through its iterations:
//!
//! ```text
//! Init → EnvSetup → (test body: AgentExecute → EvidenceCapture → Verify →
//!        Judge → Score → Persist) → Teardown → Done
//! ```
//!
//! Iterations run sequentially and each gets a fresh [`EvalContext`]. A setup
//! failure ends the iteration with [`Outcome::Error`] and writes nothing to
//! the ledger. Teardown runs after every successful setup, whatever the body
//! did, including panicking.

pub mod report;
pub mod scope;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn, Instrument};

use crate::context::EvalContext;
use crate::environment::Environment;
use crate::error::{EvalError, Stage, ValidationError};
use crate::judge::JudgeContext;
use crate::ledger::Ledger;
use crate::registry::{TestDefinition, TestRegistry};
use crate::runner::AgentRunner;

pub use report::{IterationReport, Outcome, RunReport, RunSummary, TestReport};
pub use scope::{JudgeTask, RecordedVerdict, ScopeMeta, TestScope};

pub const DEFAULT_ITERATIONS: u32 = 1;

/// Runs tests against one environment, runner, judge and ledger.
pub struct Orchestrator {
    environment: Arc<dyn Environment>,
    runner: Arc<dyn AgentRunner>,
    judge: JudgeContext,
    ledger: Arc<dyn Ledger>,
    workspace: PathBuf,
    iterations: u32,
    agent_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        environment: Arc<dyn Environment>,
        runner: Arc<dyn AgentRunner>,
        judge: JudgeContext,
        ledger: Arc<dyn Ledger>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            environment,
            runner,
            judge,
            ledger,
            workspace: workspace.into(),
            iterations: DEFAULT_ITERATIONS,
            agent_timeout: None,
            command_timeout: None,
        }
    }

    /// Iterations for tests that do not set their own count.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Runs every test matching `tags` (all tests when empty), in
    /// registration order.
    pub async fn run_all(
        &self,
        registry: &TestRegistry,
        tags: &[String],
    ) -> Result<RunReport, ValidationError> {
        registry.validate()?;
        let selected = registry.filter_by_tags(tags);
        info!(
            tests = selected.len(),
            environment = self.environment.name(),
            runner = self.runner.name(),
            judge = %self.judge.identity(),
            "Starting run"
        );

        let mut report = RunReport::default();
        for test in selected {
            report.tests.push(self.run_test(test).await);
        }

        let summary = report.summary();
        info!(
            total = summary.total,
            passed = summary.passed,
            warned = summary.warned,
            failed = summary.failed,
            errored = summary.errored,
            "Run complete"
        );
        Ok(report)
    }

    /// Runs all iterations of one test.
    pub async fn run_test(&self, test: &TestDefinition) -> TestReport {
        let iterations = test.iterations.unwrap_or(self.iterations).max(1);
        let mut reports = Vec::with_capacity(iterations as usize);

        for iteration in 1..=iterations {
            let span = tracing::info_span!("iteration", test_id = %test.id, iteration);
            let report = self.run_iteration(test, iteration).instrument(span).await;
            reports.push(report);
        }

        let report = TestReport::new(&test.id, reports);
        info!(test_id = %test.id, outcome = %report.outcome, "Test finished");
        report
    }

    async fn run_iteration(&self, test: &TestDefinition, iteration: u32) -> IterationReport {
        let started = Instant::now();

        if let Err(e) = self.environment.setup(&self.workspace).await {
            error!(stage = %Stage::EnvSetup, error = %e, "Environment setup failed");
            let err = EvalError::infrastructure(Stage::EnvSetup, e);
            let mut report = IterationReport::from_error(iteration, &err, Vec::new(), None);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return report;
        }

        let judge = match test.thresholds {
            Some(thresholds) => self.judge.clone().with_thresholds(thresholds),
            None => self.judge.clone(),
        };
        let meta = ScopeMeta {
            test_id: test.id.clone(),
            suite_path: test.suite_path.clone(),
            iteration,
            root: self.workspace.clone(),
            agent_timeout: self.agent_timeout,
            command_timeout: self.command_timeout,
        };
        let context = EvalContext::new(Arc::clone(&self.environment), &self.workspace);
        let scope = TestScope::new(
            meta,
            context,
            Arc::clone(&self.runner),
            judge,
            Arc::clone(&self.ledger),
        );

        // Spawned so a panicking body still reaches teardown.
        let body = (test.body)(scope.clone());
        let result = match tokio::spawn(body.in_current_span()).await {
            Ok(result) => result,
            Err(join_error) => Err(EvalError::Test(format!("test body panicked: {join_error}"))),
        };

        let teardown = self.environment.teardown(&self.workspace).await;

        let verdicts = scope.verdicts();
        let run_ids: Vec<u64> = verdicts.iter().map(|v| v.run_id).collect();
        let last_score = verdicts.last().map(|v| v.score);

        let mut report = match (&result, teardown) {
            (Ok(()), Ok(())) => IterationReport {
                iteration,
                outcome: verdicts
                    .iter()
                    .map(|v| Outcome::from(v.status))
                    .max()
                    .unwrap_or(Outcome::Pass),
                run_ids,
                score: last_score,
                stage: None,
                message: None,
                duration_ms: 0,
            },
            (Ok(()), Err(e)) => {
                error!(stage = %Stage::Teardown, error = %e, "Environment teardown failed");
                let err = EvalError::infrastructure(Stage::Teardown, e);
                IterationReport::from_error(iteration, &err, run_ids, last_score)
            }
            (Err(err), teardown) => {
                if let Err(e) = teardown {
                    error!(stage = %Stage::Teardown, error = %e, "Environment teardown failed");
                }
                match err {
                    EvalError::Judge(failure) => warn!(
                        run_id = failure.run_id,
                        score = failure.score,
                        status = %failure.status,
                        "Judge did not pass the outcome"
                    ),
                    other => error!(error = %other, "Iteration failed"),
                }
                IterationReport::from_error(iteration, err, run_ids, last_score)
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(outcome = %report.outcome, duration_ms = report.duration_ms, "Iteration finished");
        report
    }
}
