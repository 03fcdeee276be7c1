//! Collaborator seams for mail and notifications.
//!
//! The workflow only sees [`MailClient`] and [`Notifier`]. Shipped
//! implementations: [`StoredMailClient`] and [`TelegramNotifier`].

pub mod mail;
pub mod telegram;

pub use mail::StoredMailClient;
pub use telegram::{InboundEvent, TelegramNotifier, parse_update};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MailError, NotifyError};

/// Default per-message length limit.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4096;

/// Opaque reference to a delivered notification, `"<chat_id>:<message_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(chat_id: &str, message_id: i64) -> Self {
        Self(format!("{chat_id}:{message_id}"))
    }

    /// Wrap a stored handle string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into chat id and message id.
    pub fn parts(&self) -> Result<(&str, i64), NotifyError> {
        let (chat, msg) = self
            .0
            .rsplit_once(':')
            .ok_or_else(|| NotifyError::InvalidHandle(self.0.clone()))?;
        let msg_id = msg
            .parse::<i64>()
            .map_err(|_| NotifyError::InvalidHandle(self.0.clone()))?;
        if chat.is_empty() {
            return Err(NotifyError::InvalidHandle(self.0.clone()));
        }
        Ok((chat, msg_id))
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inline button: label shown to the user, data echoed back on press.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Remote notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Longest text accepted by one `send`.
    fn max_message_len(&self) -> usize {
        DEFAULT_MAX_MESSAGE_LENGTH
    }

    /// Deliver a message with rows of inline buttons.
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        buttons: &[Vec<Button>],
    ) -> Result<MessageHandle, NotifyError>;

    /// Replace a delivered message's text and drop its buttons.
    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), NotifyError>;

    async fn delete(&self, handle: &MessageHandle) -> Result<(), NotifyError>;

    /// Acknowledge a button press. No-op for channels without the concept.
    async fn acknowledge(&self, _callback_id: &str, _text: Option<&str>) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// An item as returned by the mail provider.
#[derive(Debug, Clone, PartialEq)]
pub struct MailItem {
    pub id: String,
    pub user_id: String,
    /// Where notifications for this item go.
    pub channel_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub thread_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Mail provider.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn fetch(&self, item_id: &str) -> Result<MailItem, MailError>;

    async fn apply_label(&self, item_id: &str, label: &str) -> Result<(), MailError>;

    async fn send_reply(&self, item_id: &str, body: &str) -> Result<(), MailError>;
}

/// Split text into chunks of at most `max_len` bytes.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_parts() {
        let h = MessageHandle::new("-100123", 42);
        assert_eq!(h.as_str(), "-100123:42");
        assert_eq!(h.parts().unwrap(), ("-100123", 42));
        assert!(MessageHandle::from_raw("nonsense").parts().is_err());
        assert!(MessageHandle::from_raw(":5").parts().is_err());
    }

    #[test]
    fn handle_serializes_as_string() {
        let h = MessageHandle::new("7", 1);
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"7:1\"");
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let chunks = split_message(&"a".repeat(5000), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "ä".repeat(10);
        let chunks = split_message(&msg, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), msg);
    }
}
