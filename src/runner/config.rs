//! Runner declarations as written in the harness configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AgentRunner, ApiRunner, CliRunner};
use crate::error::ConfigError;
use crate::llm::{ChatClient, ModelCapability, ProviderConfig};

/// A named runner.
///
/// ```yaml
/// runners:
///   - name: shell-agent
///     type: cli
///     command: "my-agent --yes -p {{prompt}}"
///   - name: gpt
///     type: api
///     api: { provider: openai, model: gpt-4o }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: RunnerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerKind {
    Cli {
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Api {
        api: ProviderConfig,
    },
}

impl RunnerConfig {
    pub fn cli(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RunnerKind::Cli {
                command: command.into(),
                timeout_ms: None,
            },
        }
    }

    pub fn api(name: impl Into<String>, api: ProviderConfig) -> Self {
        Self {
            name: name.into(),
            kind: RunnerKind::Api { api },
        }
    }

    /// Provider and model of an API runner, compared against the judge.
    pub fn model_identity(&self) -> Option<String> {
        match &self.kind {
            RunnerKind::Api { api } => Some(api.identity()),
            RunnerKind::Cli { .. } => None,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn AgentRunner>, ConfigError> {
        match &self.kind {
            RunnerKind::Cli {
                command,
                timeout_ms,
            } => {
                let mut runner = CliRunner::new(&self.name, command);
                if let Some(ms) = timeout_ms {
                    runner = runner.with_timeout(Duration::from_millis(*ms));
                }
                Ok(Arc::new(runner))
            }
            RunnerKind::Api { api } => {
                let client = ChatClient::from_config(api)?;
                let capability = ModelCapability::new(Arc::new(client));
                Ok(Arc::new(ApiRunner::new(&self.name, capability, &api.model)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runner_configs() {
        let yaml = r#"
- name: shell-agent
  type: cli
  command: "agent -p {{prompt}}"
  timeout_ms: 1000
- name: gpt
  type: api
  api:
    provider: openai
    model: gpt-4o
    api_key: sk-test
"#;
        let runners: Vec<RunnerConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(runners[0].name, "shell-agent");
        assert!(matches!(
            runners[0].kind,
            RunnerKind::Cli {
                timeout_ms: Some(1000),
                ..
            }
        ));
        assert_eq!(runners[0].model_identity(), None);
        assert_eq!(runners[1].model_identity().as_deref(), Some("openai/gpt-4o"));

        let built = runners[1].build().unwrap();
        assert_eq!(built.name(), "gpt");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = "name: x\ntype: grpc\ncommand: y\n";
        assert!(serde_yaml::from_str::<RunnerConfig>(yaml).is_err());
    }
}
