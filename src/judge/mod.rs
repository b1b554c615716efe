//! Judges: turn a rendered evaluation prompt into a structured verdict.
//!
//! - [`ModelJudge`] asks a language model through [`crate::llm::ModelCapability`].
//! - [`CliJudge`] shells out to an external command that prints the verdict.
//!
//! Every judge reply is validated by [`parse_verdict`]. Transport failures and
//! malformed replies are [`JudgeError`]s; a well-formed failing verdict is
//! simply a [`JudgeResult`] with `pass == false`.

pub mod cli;
pub mod model;
pub mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JudgeError;
use crate::scoring::Thresholds;

pub use cli::CliJudge;
pub use model::ModelJudge;
pub use prompt::{check_expected_files, render_prompt, ExpectedFile, VERDICT_SCHEMA};

/// A judge's structured verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub pass: bool,
    /// Always within `[0, 1]`.
    pub score: f64,
    pub reason: String,
    #[serde(default)]
    pub improvement: String,
}

/// Input for one judge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub prompt: String,
    /// Model override; judges fall back to their configured model.
    pub model: Option<String>,
}

impl JudgeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    /// Recorded in ledger entries as the judge model identity.
    fn identity(&self) -> &str;

    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError>;
}

/// Everything a test scope needs to judge: passed explicitly, never global.
#[derive(Clone)]
pub struct JudgeContext {
    pub judge: Arc<dyn Judge>,
    pub model: Option<String>,
    pub thresholds: Thresholds,
}

impl JudgeContext {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self {
            judge,
            model: None,
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Identity stored with each ledger entry.
    pub fn identity(&self) -> String {
        match &self.model {
            Some(model) => format!("{}:{}", self.judge.identity(), model),
            None => self.judge.identity().to_string(),
        }
    }

    pub async fn evaluate(&self, prompt: String) -> Result<JudgeResult, JudgeError> {
        let mut request = JudgeRequest::new(prompt);
        request.model = self.model.clone();
        self.judge.evaluate(request).await
    }
}

/// Validates a verdict document.
///
/// `pass` must be a boolean, `score` a number within `[0, 1]`, `reason` a
/// string. `improvement` is optional but must be a string when present.
pub fn parse_verdict(json: &str) -> Result<JudgeResult, JudgeError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| JudgeError::InvalidResponse(format!("not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| JudgeError::InvalidResponse("verdict must be a JSON object".to_string()))?;

    let invalid = |msg: &str| JudgeError::InvalidResponse(msg.to_string());

    let pass = object
        .get("pass")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid("'pass' must be a boolean"))?;
    let score = object
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid("'score' must be a number"))?;
    if !(0.0..=1.0).contains(&score) {
        return Err(JudgeError::InvalidResponse(format!(
            "'score' {score} is outside [0, 1]"
        )));
    }
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'reason' must be a string"))?
        .to_string();
    let improvement = match object.get("improvement") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(invalid("'improvement' must be a string")),
    };

    Ok(JudgeResult {
        pass,
        score,
        reason,
        improvement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_minimal() {
        let verdict = parse_verdict(r#"{"pass": false, "score": 0, "reason": "no diff"}"#).unwrap();
        assert!(!verdict.pass);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.improvement, "");
    }

    #[test]
    fn test_parse_verdict_rejects_bad_fields() {
        for doc in [
            r#"{"score": 0.5, "reason": "x"}"#,
            r#"{"pass": "yes", "score": 0.5, "reason": "x"}"#,
            r#"{"pass": true, "score": "0.5", "reason": "x"}"#,
            r#"{"pass": true, "score": -0.1, "reason": "x"}"#,
            r#"{"pass": true, "score": 0.5}"#,
            r#"{"pass": true, "score": 0.5, "reason": "x", "improvement": 3}"#,
            r#"[{"pass": true, "score": 0.5, "reason": "x"}]"#,
        ] {
            assert!(
                matches!(parse_verdict(doc), Err(JudgeError::InvalidResponse(_))),
                "accepted {doc}"
            );
        }
    }

    struct FixedJudge;

    #[async_trait]
    impl Judge for FixedJudge {
        fn identity(&self) -> &str {
            "fixed"
        }

        async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError> {
            Ok(JudgeResult {
                pass: true,
                score: 1.0,
                reason: request.model.unwrap_or_default(),
                improvement: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_judge_context_forwards_model() {
        let ctx = JudgeContext::new(Arc::new(FixedJudge)).with_model("gpt-4o");
        assert_eq!(ctx.identity(), "fixed:gpt-4o");
        let verdict = ctx.evaluate("prompt".to_string()).await.unwrap();
        assert_eq!(verdict.reason, "gpt-4o");
    }
}
