//! LLM integration for Inbox Flow.
//!
//! The workflow talks to the model through [`LlmClient`]. Two calls exist:
//! classification (structured JSON answer) and free-form draft generation.
//! Transport goes through rig-core; [`RigAdapter`] bridges rig's
//! `CompletionModel` to [`LlmClient`].

pub mod prompts;
mod rig_adapter;

pub use prompts::{ClassificationInput, Prompt};
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Configuration for creating an LLM client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create the Anthropic-backed client.
pub fn create_anthropic_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

/// Structured classification returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmClassification {
    pub category: String,
    #[serde(default)]
    pub reasoning: String,
    /// Informational only; priority is decided by the rule scorer.
    #[serde(default)]
    pub priority_hint: Option<String>,
    #[serde(default)]
    pub needs_response: bool,
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
}

/// Model access used by the workflow nodes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Classify a message.
    async fn classify(&self, prompt: &Prompt) -> Result<LlmClassification, LlmError>;

    /// Generate a reply draft.
    async fn generate(&self, prompt: &Prompt) -> Result<String, LlmError>;
}
