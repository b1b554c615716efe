//! Evaluation prompt rendering.

use std::path::Path;

use serde::Serialize;
use tera::{Context, Tera};

use crate::error::JudgeError;

/// Output contract appended to every evaluation prompt.
pub const VERDICT_SCHEMA: &str = r#"Respond with exactly one JSON object of this shape and nothing else:
{"pass": <boolean>, "score": <number between 0 and 1>, "reason": "<why>", "improvement": "<what would raise the score, or empty>"}"#;

const EVALUATION_TEMPLATE: &str = r#"You are evaluating the work of an automated coding agent.

## Criteria

{{ criteria }}
{% if expected_files %}
## Expected files
{% for file in expected_files %}
- {{ file.path }}: {% if file.present %}present{% else %}MISSING{% endif %}
{%- endfor %}
{% endif %}
## Evidence

{% if logs %}{{ logs }}{% else %}(no evidence captured){% endif %}

## Output

{{ schema }}
"#;

/// An expected file and whether it exists in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedFile {
    pub path: String,
    pub present: bool,
}

/// Checks each expected path relative to `root`.
pub fn check_expected_files(root: &Path, paths: &[String]) -> Vec<ExpectedFile> {
    paths
        .iter()
        .map(|path| ExpectedFile {
            path: path.clone(),
            present: root.join(path).exists(),
        })
        .collect()
}

/// Renders the evaluation prompt. Output is deterministic for equal input.
pub fn render_prompt(
    criteria: &str,
    expected_files: &[ExpectedFile],
    logs: &str,
) -> Result<String, JudgeError> {
    let mut context = Context::new();
    context.insert("criteria", criteria.trim());
    context.insert("expected_files", expected_files);
    context.insert("logs", logs.trim_end());
    context.insert("schema", VERDICT_SCHEMA);

    Ok(Tera::one_off(EVALUATION_TEMPLATE, &context, false)?)
}
