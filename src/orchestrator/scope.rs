//! The handle a test body works through.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::{CommandResult, EvalContext};
use crate::error::{EvalError, JudgeFailure, Stage};
use crate::judge::{check_expected_files, render_prompt, JudgeContext, JudgeResult};
use crate::ledger::{Ledger, LedgerEntry, RunRecord};
use crate::runner::{AgentRunner, RunContext, RunnerOutput};
use crate::scoring::{weighted_score, Status, Thresholds, WeightedScore};

/// A sub-task judged on its own and folded into a weighted score.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeTask {
    pub name: String,
    pub criteria: String,
    pub weight: Option<f64>,
}

impl JudgeTask {
    pub fn new(name: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            criteria: criteria.into(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: Option<f64>) -> Self {
        self.weight = weight;
        self
    }
}

/// A verdict that was persisted during the iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVerdict {
    pub run_id: u64,
    pub score: f64,
    pub pass: bool,
    pub status: Status,
}

/// Identity of the test iteration a scope belongs to.
#[derive(Debug, Clone)]
pub struct ScopeMeta {
    pub test_id: String,
    pub suite_path: Vec<String>,
    pub iteration: u32,
    pub root: PathBuf,
    pub agent_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

struct ScopeInner {
    meta: ScopeMeta,
    runner: Arc<dyn AgentRunner>,
    judge: JudgeContext,
    ledger: Arc<dyn Ledger>,
    context: Mutex<EvalContext>,
    started: Instant,
    verdicts: StdMutex<Vec<RecordedVerdict>>,
}

/// Per-iteration access to the agent, the evidence context and the judge.
///
/// Cheap to clone; clones share the same context.
#[derive(Clone)]
pub struct TestScope {
    inner: Arc<ScopeInner>,
}

impl TestScope {
    pub fn new(
        meta: ScopeMeta,
        context: EvalContext,
        runner: Arc<dyn AgentRunner>,
        judge: JudgeContext,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                meta,
                runner,
                judge,
                ledger,
                context: Mutex::new(context),
                started: Instant::now(),
                verdicts: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.inner.meta.test_id
    }

    pub fn iteration(&self) -> u32 {
        self.inner.meta.iteration
    }

    pub fn root(&self) -> &Path {
        &self.inner.meta.root
    }

    pub fn thresholds(&self) -> Thresholds {
        self.inner.judge.thresholds
    }

    pub fn runner_name(&self) -> &str {
        self.inner.runner.name()
    }

    /// Runs the agent on `prompt` in the workspace.
    ///
    /// A non-zero agent exit is returned as output, not as an error.
    pub async fn agent(&self, prompt: &str) -> Result<RunnerOutput, EvalError> {
        let environment = Arc::clone(self.inner.context.lock().await.environment());
        let mut ctx = RunContext::new(self.root(), environment);
        ctx.timeout = self.inner.meta.agent_timeout;

        let output = self
            .inner
            .runner
            .execute(prompt, &ctx)
            .await
            .map_err(|e| EvalError::infrastructure(Stage::AgentExecute, e))?;

        match &output {
            RunnerOutput::Process(out) => {
                debug!(test_id = %self.test_id(), exit_code = out.exit_code, "Agent finished");
            }
            RunnerOutput::Files(files) => {
                debug!(test_id = %self.test_id(), files = files.len(), "Agent wrote files");
            }
        }
        Ok(output)
    }

    /// Captures the current workspace diff into the context.
    pub async fn store_diff(&self) -> Result<String, EvalError> {
        let mut context = self.inner.context.lock().await;
        context
            .store_diff()
            .await
            .map(str::to_string)
            .map_err(|e| EvalError::infrastructure(Stage::EvidenceCapture, e))
    }

    /// Runs a verification command with the configured command timeout.
    pub async fn run_command(&self, name: &str, command: &str) -> CommandResult {
        self.run_command_with_timeout(name, command, None).await
    }

    /// Runs a verification command; `timeout` overrides the configured one.
    pub async fn run_command_with_timeout(
        &self,
        name: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> CommandResult {
        let timeout = timeout.or(self.inner.meta.command_timeout);
        self.inner
            .context
            .lock()
            .await
            .run_command(name, command, timeout)
            .await
    }

    pub async fn commands(&self) -> Vec<CommandResult> {
        self.inner.context.lock().await.commands()
    }

    pub async fn diff(&self) -> Option<String> {
        self.inner.context.lock().await.diff().map(str::to_string)
    }

    pub async fn logs(&self) -> String {
        self.inner.context.lock().await.logs()
    }

    /// Verdicts persisted so far in this iteration.
    pub fn verdicts(&self) -> Vec<RecordedVerdict> {
        match self.inner.verdicts.lock() {
            Ok(verdicts) => verdicts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Judges the captured evidence against `criteria` with exactly one
    /// judge call, records the outcome, and fails when it does not pass.
    pub async fn to_pass_judge(
        &self,
        criteria: &str,
        expected_files: &[String],
    ) -> Result<JudgeResult, EvalError> {
        let prompt = self.render(criteria, expected_files).await?;
        let verdict = self.call_judge(prompt).await?;
        self.settle(verdict).await
    }

    /// Judges each task separately and records one entry for the weighted
    /// average of their scores. Only that average is thresholded; each task's
    /// own verdict is kept in the reason.
    pub async fn judge_tasks(
        &self,
        tasks: &[JudgeTask],
        expected_files: &[String],
    ) -> Result<JudgeResult, EvalError> {
        if tasks.is_empty() {
            return Err(EvalError::Test("judge_tasks needs at least one task".to_string()));
        }

        let mut parts = Vec::with_capacity(tasks.len());
        let mut reasons = Vec::with_capacity(tasks.len());
        let mut improvements = Vec::new();

        for task in tasks {
            let prompt = self.render(&task.criteria, expected_files).await?;
            let verdict = self.call_judge(prompt).await?;
            debug!(test_id = %self.test_id(), task = %task.name, score = verdict.score, "Task judged");

            let mark = if verdict.pass { "pass" } else { "fail" };
            reasons.push(format!(
                "[{}] {} {:.2}: {}",
                task.name, mark, verdict.score, verdict.reason
            ));
            if !verdict.improvement.trim().is_empty() {
                improvements.push(format!("[{}] {}", task.name, verdict.improvement));
            }
            parts.push(WeightedScore::new(&task.name, verdict.score, task.weight));
        }

        let score = weighted_score(&parts)?;
        let combined = JudgeResult {
            pass: self.thresholds().passes(score),
            score,
            reason: reasons.join("\n"),
            improvement: improvements.join("\n"),
        };
        self.settle(combined).await
    }

    async fn render(&self, criteria: &str, expected_files: &[String]) -> Result<String, EvalError> {
        let logs = self.logs().await;
        let expected = check_expected_files(self.root(), expected_files);
        render_prompt(criteria, &expected, &logs).map_err(|e| EvalError::infrastructure(Stage::Judge, e))
    }

    async fn call_judge(&self, prompt: String) -> Result<JudgeResult, EvalError> {
        self.inner
            .judge
            .evaluate(prompt)
            .await
            .map_err(|e| EvalError::infrastructure(Stage::Judge, e))
    }

    /// Applies thresholds, persists the entry, then reports failure if any.
    async fn settle(&self, verdict: JudgeResult) -> Result<JudgeResult, EvalError> {
        let thresholds = self.thresholds();
        let pass = verdict.pass && thresholds.passes(verdict.score);
        let mut status = thresholds.status(verdict.score);
        if !verdict.pass && status == Status::Pass {
            status = Status::Warn;
        }

        let snapshot = self.inner.context.lock().await.snapshot();
        let meta = &self.inner.meta;
        let record = RunRecord {
            test_id: meta.test_id.clone(),
            runner: self.runner_name().to_string(),
            judge_model: self.inner.judge.identity(),
            score: verdict.score,
            pass,
            reason: verdict.reason.clone(),
            improvement: verdict.improvement.clone(),
            status,
            iteration: meta.iteration,
            context: snapshot,
            duration_ms: self.inner.started.elapsed().as_millis() as u64,
            suite_path: (!meta.suite_path.is_empty()).then(|| meta.suite_path.clone()),
            thresholds: Some(thresholds),
        };

        let entry: LedgerEntry = self
            .inner
            .ledger
            .record_run(record)
            .await
            .map_err(|e| EvalError::infrastructure(Stage::Persist, e))?;

        info!(
            test_id = %meta.test_id,
            iteration = meta.iteration,
            run_id = entry.id,
            score = verdict.score,
            status = %status,
            "Recorded verdict"
        );

        let recorded = RecordedVerdict {
            run_id: entry.id,
            score: verdict.score,
            pass,
            status,
        };
        match self.inner.verdicts.lock() {
            Ok(mut verdicts) => verdicts.push(recorded),
            Err(poisoned) => poisoned.into_inner().push(recorded),
        }

        if !pass {
            return Err(JudgeFailure {
                test_id: meta.test_id.clone(),
                run_id: entry.id,
                score: verdict.score,
                status,
                reason: verdict.reason,
                improvement: verdict.improvement,
            }
            .into());
        }
        Ok(JudgeResult { pass, ..verdict })
    }
}
