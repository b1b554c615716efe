//! Structured model calls: judging and file generation.
//!
//! Both calls append a fixed output-schema instruction to the prompt and
//! validate the reply strictly. A reply that does not match the schema is an
//! error, never a guessed default.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::client::{GenerationRequest, LlmProvider, Message};
use super::json::extract_json_object;
use crate::error::{JudgeError, RunnerError};
use crate::judge::{parse_verdict, JudgeResult, VERDICT_SCHEMA};

const JUDGE_SYSTEM_PROMPT: &str = "You are a strict code reviewer grading the work of an \
automated coding agent. Judge only from the evidence provided. Reply with a single JSON \
object and nothing else.";

const AGENT_SYSTEM_PROMPT: &str = "You are a coding agent. You change a repository by \
returning the complete new content of every file you create or modify. Reply with a single \
JSON object and nothing else.";

const FILES_SCHEMA: &str = r#"Respond with exactly one JSON object of this shape:
{"files": [{"path": "<path relative to the repository root>", "content": "<full file content>"}]}
Return an empty list if no file needs to change."#;

/// A file produced by a model, relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Judging and file generation on top of an [`LlmProvider`].
#[derive(Clone)]
pub struct ModelCapability {
    provider: Arc<dyn LlmProvider>,
}

impl ModelCapability {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        schema: &str,
        model: &str,
    ) -> Result<String, crate::error::LlmError> {
        let request = GenerationRequest::new(
            model,
            vec![
                Message::system(system),
                Message::user(if prompt.contains(schema) {
                    prompt.to_string()
                } else {
                    format!("{prompt}\n\n{schema}")
                }),
            ],
        )
        .with_temperature(0.0);

        let response = self.provider.generate(request).await?;
        let content = response.first_content().unwrap_or_default().to_string();
        debug!(model = model, chars = content.len(), "Model replied");
        Ok(content)
    }

    /// Asks the model for a verdict on `prompt`.
    pub async fn evaluate(&self, prompt: &str, model: &str) -> Result<JudgeResult, JudgeError> {
        let reply = self
            .complete(JUDGE_SYSTEM_PROMPT, prompt, VERDICT_SCHEMA, model)
            .await?;
        let json = extract_json_object(&reply)
            .map_err(|e| JudgeError::InvalidResponse(e.to_string()))?;
        parse_verdict(&json)
    }

    /// Asks the model for the files implementing `prompt`.
    pub async fn generate_files(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<Vec<GeneratedFile>, RunnerError> {
        let reply = self
            .complete(AGENT_SYSTEM_PROMPT, prompt, FILES_SCHEMA, model)
            .await?;
        let json = extract_json_object(&reply)
            .map_err(|e| RunnerError::InvalidResponse(e.to_string()))?;
        parse_files(&json)
    }
}

/// Validates a `{"files": [{path, content}]}` document.
pub fn parse_files(json: &str) -> Result<Vec<GeneratedFile>, RunnerError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| RunnerError::InvalidResponse(e.to_string()))?;

    let files = value
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| RunnerError::InvalidResponse("missing array field 'files'".to_string()))?;

    files
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let field = |name: &str| {
                entry.get(name).and_then(Value::as_str).ok_or_else(|| {
                    RunnerError::InvalidResponse(format!("files[{i}].{name} must be a string"))
                })
            };
            Ok::<_, RunnerError>(GeneratedFile {
                path: field("path")?.to_string(),
                content: field("content")?.to_string(),
            })
        })
        .collect()
}
