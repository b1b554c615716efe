//! Model access.
//!
//! [`ChatClient`] talks to any OpenAI-compatible chat completions endpoint,
//! with presets for OpenAI, Anthropic, OpenRouter and Ollama. The
//! [`ModelCapability`] wrapper turns free-form completions into validated
//! verdicts and file sets.
//!
//! ```ignore
//! use judge_forge::llm::{ChatClient, ModelCapability, ProviderConfig};
//! use std::sync::Arc;
//!
//! let client = ChatClient::from_config(&ProviderConfig::new("openai", "gpt-4o"))?;
//! let model = ModelCapability::new(Arc::new(client));
//! let verdict = model.evaluate("Does the diff add a /health route?", "gpt-4o").await?;
//! ```

pub mod capability;
pub mod client;
pub mod json;

pub use capability::{GeneratedFile, ModelCapability};
pub use client::{
    ChatClient, Choice, GenerationRequest, GenerationResponse, LlmProvider, Message,
    ProviderConfig, ProviderKind, Usage,
};
pub use json::{extract_json_object, JsonExtractionError};
