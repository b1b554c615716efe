use async_trait::async_trait;
use tracing::debug;

use super::{Judge, JudgeRequest, JudgeResult};
use crate::error::JudgeError;
use crate::llm::{ModelCapability, ProviderConfig};

/// Judge backed by a language model.
pub struct ModelJudge {
    capability: ModelCapability,
    model: String,
    identity: String,
}

impl ModelJudge {
    pub fn new(capability: ModelCapability, provider: &str, model: impl Into<String>) -> Self {
        let model = model.into();
        let identity = ProviderConfig::new(provider, model.clone()).identity();
        Self {
            capability,
            model,
            identity,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Judge for ModelJudge {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        debug!(judge = %self.identity, model = model, "Evaluating");
        self.capability.evaluate(&request.prompt, model).await
    }
}
