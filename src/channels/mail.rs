//! Mail client backed by the local item store.
//!
//! Items arrive through the HTTP API and live in the `items` table; labels are
//! written back to the row and replies go to the `outbound_replies` outbox.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::channels::{MailClient, MailItem};
use crate::error::{DatabaseError, MailError};
use crate::store::Database;

pub struct StoredMailClient {
    db: Arc<dyn Database>,
}

impl StoredMailClient {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MailClient for StoredMailClient {
    async fn fetch(&self, item_id: &str) -> Result<MailItem, MailError> {
        let item = self
            .db
            .get_item(item_id)
            .await?
            .ok_or_else(|| MailError::NotFound {
                item_id: item_id.to_string(),
            })?;
        Ok(MailItem {
            id: item.id,
            user_id: item.user_id,
            channel_id: item.channel_id,
            sender: item.sender,
            subject: item.subject,
            body: item.body,
            thread_ref: item.thread_ref,
            received_at: item.received_at,
        })
    }

    async fn apply_label(&self, item_id: &str, label: &str) -> Result<(), MailError> {
        match self.db.set_item_label(item_id, label).await {
            Ok(()) => Ok(()),
            Err(DatabaseError::NotFound { .. }) => Err(MailError::NotFound {
                item_id: item_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_reply(&self, item_id: &str, body: &str) -> Result<(), MailError> {
        let item = self.fetch(item_id).await?;
        let subject = if item.subject.to_lowercase().starts_with("re:") {
            item.subject.clone()
        } else {
            format!("Re: {}", item.subject)
        };
        self.db
            .record_outbound_reply(item_id, &item.sender, &subject, body)
            .await?;
        info!(item_id, recipient = %item.sender, "Reply queued in outbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, NewItem};
    use chrono::Utc;

    async fn setup() -> (Arc<dyn Database>, String) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let id = db
            .insert_item(&NewItem {
                external_id: "ext".into(),
                user_id: "u1".into(),
                channel_id: "99".into(),
                sender: "alice@example.com".into(),
                subject: "Question".into(),
                body: "Can you help?".into(),
                thread_ref: None,
                received_at: Utc::now(),
            })
            .await
            .unwrap();
        (db, id)
    }

    #[tokio::test]
    async fn fetch_and_label() {
        let (db, id) = setup().await;
        let client = StoredMailClient::new(Arc::clone(&db));

        let item = client.fetch(&id).await.unwrap();
        assert_eq!(item.channel_id, "99");

        client.apply_label(&id, "Work").await.unwrap();
        assert_eq!(db.get_item(&id).await.unwrap().unwrap().label.as_deref(), Some("Work"));
    }

    #[tokio::test]
    async fn missing_item_is_not_found() {
        let (db, _) = setup().await;
        let client = StoredMailClient::new(db);
        assert!(matches!(client.fetch("nope").await, Err(MailError::NotFound { .. })));
        assert!(matches!(
            client.apply_label("nope", "x").await,
            Err(MailError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reply_goes_to_outbox() {
        let (db, id) = setup().await;
        let client = StoredMailClient::new(Arc::clone(&db));
        client.send_reply(&id, "Sure").await.unwrap();

        let replies = db.list_outbound_replies(&id).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].subject, "Re: Question");
        assert_eq!(replies[0].recipient, "alice@example.com");
    }
}
