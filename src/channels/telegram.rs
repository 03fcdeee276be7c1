//! Telegram notifier using the Bot API through `reqwest`.
//!
//! Sends approval prompts with inline keyboards, edits them once the user has
//! decided, and parses webhook updates (button presses and text replies).

use async_trait::async_trait;
use serde_json::Value;

use crate::channels::{Button, DEFAULT_MAX_MESSAGE_LENGTH, MessageHandle, Notifier};
use crate::error::NotifyError;

const NAME: &str = "telegram";

/// Telegram notifier.
pub struct TelegramNotifier {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: "https://api.telegram.org".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// POST a Bot API method and return its `result`.
    async fn call(&self, method: &str, recipient: &str, body: &Value) -> Result<Value, NotifyError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout {
                        name: NAME.into(),
                        after: std::time::Duration::ZERO,
                    }
                } else {
                    NotifyError::Network {
                        name: NAME.into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status().as_u16();
        let data: Value = resp.json().await.unwrap_or(Value::Null);
        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(map_api_error(status, &data, recipient))
    }
}

/// Map a failed Bot API response to a typed error.
fn map_api_error(status: u16, data: &Value, recipient: &str) -> NotifyError {
    let code = data
        .get("error_code")
        .and_then(Value::as_u64)
        .map(|c| c as u16)
        .unwrap_or(status);
    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let lower = description.to_lowercase();

    match code {
        429 => NotifyError::RateLimited {
            name: NAME.into(),
            retry_after: data
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .map(std::time::Duration::from_secs),
        },
        403 => NotifyError::Unreachable {
            recipient: recipient.into(),
            reason: description,
        },
        400 if lower.contains("chat not found") || lower.contains("user is deactivated") => {
            NotifyError::Unreachable {
                recipient: recipient.into(),
                reason: description,
            }
        }
        _ => NotifyError::Api {
            name: NAME.into(),
            status: code,
            reason: description,
        },
    }
}

/// Build an `inline_keyboard` reply markup.
fn inline_keyboard(buttons: &[Vec<Button>]) -> Value {
    let rows: Vec<Value> = buttons
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|b| serde_json::json!({ "text": b.label, "callback_data": b.data }))
                    .collect(),
            )
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        buttons: &[Vec<Button>],
    ) -> Result<MessageHandle, NotifyError> {
        let mut body = serde_json::json!({
            "chat_id": channel_id,
            "text": truncate(text, DEFAULT_MAX_MESSAGE_LENGTH),
        });
        if !buttons.is_empty() {
            body["reply_markup"] = inline_keyboard(buttons);
        }

        let result = self.call("sendMessage", channel_id, &body).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| NotifyError::Api {
                name: NAME.into(),
                status: 200,
                reason: "sendMessage result has no message_id".into(),
            })?;
        tracing::debug!(chat_id = channel_id, message_id, "Telegram message sent");
        Ok(MessageHandle::new(channel_id, message_id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), NotifyError> {
        let (chat_id, message_id) = handle.parts()?;
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": truncate(text, DEFAULT_MAX_MESSAGE_LENGTH),
            "reply_markup": { "inline_keyboard": [] },
        });
        match self.call("editMessageText", chat_id, &body).await {
            Ok(_) => Ok(()),
            Err(NotifyError::Api { reason, .. }) if reason.contains("message is not modified") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), NotifyError> {
        let (chat_id, message_id) = handle.parts()?;
        let body = serde_json::json!({ "chat_id": chat_id, "message_id": message_id });
        self.call("deleteMessage", chat_id, &body).await.map(|_| ())
    }

    async fn acknowledge(&self, callback_id: &str, text: Option<&str>) -> Result<(), NotifyError> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = Value::String(text.to_string());
        }
        self.call("answerCallbackQuery", callback_id, &body)
            .await
            .map(|_| ())
    }
}

// ── Webhook updates ─────────────────────────────────────────────────

/// An inbound update relevant to the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A button press on one of our messages.
    Callback {
        callback_id: String,
        chat_id: String,
        handle: Option<MessageHandle>,
        data: String,
    },
    /// A plain text message (used for edited drafts).
    Text { chat_id: String, text: String },
}

/// Parse a webhook update. Returns None for update kinds we ignore.
pub fn parse_update(update: &Value) -> Option<InboundEvent> {
    if let Some(cb) = update.get("callback_query") {
        let callback_id = cb.get("id").and_then(Value::as_str)?.to_string();
        let data = cb.get("data").and_then(Value::as_str)?.to_string();
        let message = cb.get("message");
        let chat_id = message
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let handle = message
            .and_then(|m| m.get("message_id"))
            .and_then(Value::as_i64)
            .filter(|_| !chat_id.is_empty())
            .map(|mid| MessageHandle::new(&chat_id, mid));
        return Some(InboundEvent::Callback {
            callback_id,
            chat_id,
            handle,
            data,
        });
    }

    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();
    Some(InboundEvent::Text {
        chat_id,
        text: text.to_string(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
