//! Runner that lets a model write files directly.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{AgentRunner, RunContext, RunnerOutput};
use crate::error::RunnerError;
use crate::llm::{GeneratedFile, ModelCapability};

pub struct ApiRunner {
    name: String,
    capability: ModelCapability,
    model: String,
}

impl ApiRunner {
    pub fn new(name: impl Into<String>, capability: ModelCapability, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Rejects empty, absolute and parent-escaping paths.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, RunnerError> {
    let candidate = Path::new(path);
    if path.trim().is_empty() {
        return Err(RunnerError::UnsafePath("empty path".to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RunnerError::UnsafePath(path.to_string()));
            }
        }
    }
    Ok(candidate.to_path_buf())
}

async fn write_files(root: &Path, files: &[GeneratedFile]) -> Result<Vec<PathBuf>, RunnerError> {
    // Validate everything before touching the workspace.
    let paths = files
        .iter()
        .map(|f| validate_relative_path(&f.path))
        .collect::<Result<Vec<_>, _>>()?;

    for (path, file) in paths.iter().zip(files) {
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.content).await?;
        debug!(path = %path.display(), bytes = file.content.len(), "Wrote file");
    }
    Ok(paths)
}

#[async_trait]
impl AgentRunner for ApiRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, prompt: &str, ctx: &RunContext) -> Result<RunnerOutput, RunnerError> {
        info!(runner = %self.name, model = %self.model, "Requesting file set from model");
        let files = self.capability.generate_files(prompt, &self.model).await?;
        let written = write_files(&ctx.cwd, &files).await?;
        info!(runner = %self.name, files = written.len(), "Applied model output");
        Ok(RunnerOutput::Files(written))
    }
}
