//! Adapter from rig's `CompletionModel` to our [`LlmClient`] trait.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::AssistantContent;

use crate::error::LlmError;
use crate::llm::prompts::{clean_draft, parse_classification};
use crate::llm::{LlmClassification, LlmClient, Prompt};

const CLASSIFY_MAX_TOKENS: u64 = 600;
const CLASSIFY_TEMPERATURE: f64 = 0.0;
const DRAFT_MAX_TOKENS: u64 = 1000;
const DRAFT_TEMPERATURE: f64 = 0.4;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        max_tokens: u64,
        temperature: f64,
    ) -> Result<String, LlmError> {
        let response = self
            .model
            .completion_request(prompt.user.as_str())
            .preamble(prompt.system.clone())
            .temperature(temperature)
            .max_tokens(max_tokens)
            .send()
            .await
            .map_err(|e| map_completion_error(self.provider, e))?;

        let text = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.into(),
                reason: "empty completion".into(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl<M> LlmClient for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.provider
    }

    async fn classify(&self, prompt: &Prompt) -> Result<LlmClassification, LlmError> {
        let text = self
            .complete(prompt, CLASSIFY_MAX_TOKENS, CLASSIFY_TEMPERATURE)
            .await?;
        parse_classification(self.provider, &text)
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let text = self
            .complete(prompt, DRAFT_MAX_TOKENS, DRAFT_TEMPERATURE)
            .await?;
        Ok(clean_draft(&text))
    }
}

// ── Error mapping ───────────────────────────────────────────────────

/// Map a rig completion error onto [`LlmError`], keeping the
/// transient/permanent split that the retry loop relies on.
pub(crate) fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::JsonError(e) => LlmError::Json(e),
        CompletionError::ProviderError(message) => provider_error(provider, message),
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.into(),
            reason,
        },
        other => {
            let reason = other.to_string();
            if is_timeout(&reason.to_lowercase()) {
                LlmError::Timeout {
                    provider: provider.into(),
                    after: Duration::ZERO,
                }
            } else {
                LlmError::RequestFailed {
                    provider: provider.into(),
                    reason,
                }
            }
        }
    }
}

/// Classify an error body returned by the provider.
fn provider_error(provider: &str, message: String) -> LlmError {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate_limit", "429", "too many requests"]) {
        LlmError::RateLimited {
            provider: provider.into(),
            retry_after: None,
        }
    } else if is_timeout(&lower) {
        LlmError::Timeout {
            provider: provider.into(),
            after: Duration::ZERO,
        }
    } else if has(&["authentication_error", "permission_error", "x-api-key", "401", "403"]) {
        LlmError::AuthFailed {
            provider: provider.into(),
        }
    } else if has(&[
        "invalid_request_error",
        "not_found_error",
        "request_too_large",
        "400",
        "404",
        "413",
    ]) {
        LlmError::InvalidRequest {
            provider: provider.into(),
            reason: message,
        }
    } else {
        // overloaded_error, api_error and other server-side failures.
        LlmError::RequestFailed {
            provider: provider.into(),
            reason: message,
        }
    }
}

fn is_timeout(lower: &str) -> bool {
    lower.contains("timed out") || lower.contains("timeout")
}
