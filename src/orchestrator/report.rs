//! Outcome reports for iterations, tests and whole runs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Stage};
use crate::scoring::Status;

/// Iteration or test outcome, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
    /// The harness itself failed; no verdict was reached.
    Error,
}

impl From<Status> for Outcome {
    fn from(status: Status) -> Self {
        match status {
            Status::Pass => Outcome::Pass,
            Status::Warn => Outcome::Warn,
            Status::Fail => Outcome::Fail,
        }
    }
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Warn)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "pass",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub outcome: Outcome,
    /// Ledger ids written during the iteration.
    pub run_ids: Vec<u64>,
    /// Score of the last verdict, if any was reached.
    pub score: Option<f64>,
    /// Stage that failed, for infrastructure errors.
    pub stage: Option<Stage>,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl IterationReport {
    /// Report for an iteration that ended with `error`.
    pub fn from_error(iteration: u32, error: &EvalError, run_ids: Vec<u64>, score: Option<f64>) -> Self {
        let (outcome, stage) = match error {
            EvalError::Infrastructure { stage, .. } => (Outcome::Error, Some(*stage)),
            EvalError::Validation(_) => (Outcome::Error, None),
            EvalError::Judge(failure) => (Outcome::from(failure.status).max(Outcome::Warn), Some(Stage::Judge)),
            EvalError::Test(_) => (Outcome::Fail, None),
        };
        Self {
            iteration,
            outcome,
            run_ids,
            score,
            stage,
            message: Some(error.to_string()),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_id: String,
    /// Worst iteration outcome.
    pub outcome: Outcome,
    pub iterations: Vec<IterationReport>,
}

impl TestReport {
    pub fn new(test_id: impl Into<String>, iterations: Vec<IterationReport>) -> Self {
        let outcome = iterations
            .iter()
            .map(|i| i.outcome)
            .max()
            .unwrap_or(Outcome::Error);
        Self {
            test_id: test_id.into(),
            outcome,
            iterations,
        }
    }

    /// Mean of the iteration scores that reached a verdict.
    pub fn average_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.iterations.iter().filter_map(|i| i.score).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub warned: usize,
    pub failed: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub tests: Vec<TestReport>,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.tests.len(),
            ..Default::default()
        };
        for test in &self.tests {
            match test.outcome {
                Outcome::Pass => summary.passed += 1,
                Outcome::Warn => summary.warned += 1,
                Outcome::Fail => summary.failed += 1,
                Outcome::Error => summary.errored += 1,
            }
        }
        summary
    }

    /// True when no test failed or errored.
    pub fn is_success(&self) -> bool {
        self.tests.iter().all(|t| t.outcome.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JudgeFailure;

    fn iteration(n: u32, outcome: Outcome, score: Option<f64>) -> IterationReport {
        IterationReport {
            iteration: n,
            outcome,
            run_ids: vec![],
            score,
            stage: None,
            message: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_outcome_is_worst_iteration() {
        let report = TestReport::new(
            "t",
            vec![
                iteration(1, Outcome::Pass, Some(0.9)),
                iteration(2, Outcome::Warn, Some(0.6)),
                iteration(3, Outcome::Pass, Some(0.9)),
            ],
        );
        assert_eq!(report.outcome, Outcome::Warn);
        assert!((report.average_score().unwrap() - 0.8).abs() < 1e-9);

        let report = TestReport::new(
            "t",
            vec![iteration(1, Outcome::Fail, Some(0.1)), iteration(2, Outcome::Error, None)],
        );
        assert_eq!(report.outcome, Outcome::Error);
    }

    #[test]
    fn test_error_classification() {
        let infra = EvalError::infrastructure(Stage::EnvSetup, "boom");
        let report = IterationReport::from_error(1, &infra, vec![], None);
        assert_eq!(report.outcome, Outcome::Error);
        assert_eq!(report.stage, Some(Stage::EnvSetup));

        let judged = EvalError::from(JudgeFailure {
            test_id: "t".to_string(),
            run_id: 4,
            score: 0.3,
            status: Status::Fail,
            reason: "no".to_string(),
            improvement: String::new(),
        });
        let report = IterationReport::from_error(1, &judged, vec![4], Some(0.3));
        assert_eq!(report.outcome, Outcome::Fail);

        let assertion = EvalError::Test("expected 2 commands".to_string());
        assert_eq!(
            IterationReport::from_error(1, &assertion, vec![], None).outcome,
            Outcome::Fail
        );
    }

    #[test]
    fn test_summary_counts() {
        let report = RunReport {
            tests: vec![
                TestReport::new("a", vec![iteration(1, Outcome::Pass, Some(1.0))]),
                TestReport::new("b", vec![iteration(1, Outcome::Error, None)]),
            ],
        };
        let summary = report.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.errored, 1);
        assert!(!report.is_success());
    }
}
