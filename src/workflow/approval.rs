//! Approval gate: links a suspended workflow to the user's answer.
//!
//! Every lookup hits the store, so a callback arriving days later (or after a
//! restart) still finds its workflow. Button data is compact text because
//! Telegram caps `callback_data` at 64 bytes:
//!
//! | data            | meaning                              |
//! |-----------------|--------------------------------------|
//! | `a:<item>`      | approve                              |
//! | `r:<item>`      | reject                               |
//! | `e:<item>`      | edit the draft (opens a ticket)      |
//! | `c:<item>:<n>`  | change category to option `n`        |

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::channels::{Button, MessageHandle};
use crate::error::{DatabaseError, WorkflowError};
use crate::store::{ApprovalMapping, ApprovalState, Database, PendingEdit};

/// How to find an approval mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalKey {
    Handle(MessageHandle),
    Item(String),
}

/// What a button press asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Approve,
    Reject,
    Edit,
    /// Index into the snapshot's category options.
    Change(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAction {
    pub item_id: String,
    pub kind: CallbackKind,
}

impl CallbackAction {
    pub fn encode(&self) -> String {
        match self.kind {
            CallbackKind::Approve => format!("a:{}", self.item_id),
            CallbackKind::Reject => format!("r:{}", self.item_id),
            CallbackKind::Edit => format!("e:{}", self.item_id),
            CallbackKind::Change(n) => format!("c:{}:{n}", self.item_id),
        }
    }
}

/// Decode button data.
pub fn parse_callback(data: &str) -> Result<CallbackAction, WorkflowError> {
    let unknown = || WorkflowError::UnknownCallback(data.to_string());
    let (tag, rest) = data.split_once(':').ok_or_else(unknown)?;
    if rest.is_empty() {
        return Err(unknown());
    }

    let (item_id, kind) = match tag {
        "a" => (rest, CallbackKind::Approve),
        "r" => (rest, CallbackKind::Reject),
        "e" => (rest, CallbackKind::Edit),
        "c" => {
            let (item, index) = rest.rsplit_once(':').ok_or_else(unknown)?;
            let index = index.parse::<usize>().map_err(|_| unknown())?;
            if item.is_empty() {
                return Err(unknown());
            }
            (item, CallbackKind::Change(index))
        }
        _ => return Err(unknown()),
    };

    Ok(CallbackAction {
        item_id: item_id.to_string(),
        kind,
    })
}

/// Inline keyboard for an approval prompt.
///
/// First row: approve, edit (only with a draft), reject. Then the other
/// category options, three per row.
pub fn approval_buttons(
    item_id: &str,
    category_options: &[String],
    proposed: Option<&str>,
    has_draft: bool,
) -> Vec<Vec<Button>> {
    let action = |kind| {
        CallbackAction {
            item_id: item_id.to_string(),
            kind,
        }
        .encode()
    };

    let mut first = vec![Button::new("✅ Approve", action(CallbackKind::Approve))];
    if has_draft {
        first.push(Button::new("✏️ Edit reply", action(CallbackKind::Edit)));
    }
    first.push(Button::new("❌ Reject", action(CallbackKind::Reject)));

    let alternatives: Vec<Button> = category_options
        .iter()
        .enumerate()
        .filter(|(_, c)| proposed.is_none_or(|p| !p.eq_ignore_ascii_case(c)))
        .map(|(i, c)| Button::new(format!("→ {c}"), action(CallbackKind::Change(i))))
        .collect();

    let mut rows = vec![first];
    rows.extend(alternatives.chunks(3).map(<[Button]>::to_vec));
    rows
}

pub struct ApprovalGate {
    db: Arc<dyn Database>,
    edit_ttl: Duration,
}

impl ApprovalGate {
    pub fn new(db: Arc<dyn Database>, edit_ttl: std::time::Duration) -> Self {
        Self {
            db,
            edit_ttl: Duration::from_std(edit_ttl).unwrap_or_else(|_| Duration::hours(24)),
        }
    }

    /// Record a delivered notification. The mapping points at the newest
    /// handle; every handle stays resolvable.
    pub async fn register(
        &self,
        item_id: &str,
        thread_id: &str,
        user_id: &str,
        handle: &MessageHandle,
        position: usize,
    ) -> Result<(), DatabaseError> {
        self.db
            .record_approval_handle(handle.as_str(), item_id, thread_id, position)
            .await?;
        let now = Utc::now();
        self.db
            .upsert_approval_mapping(&ApprovalMapping {
                item_id: item_id.to_string(),
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                message_handle: handle.as_str().to_string(),
                state: ApprovalState::AwaitingApproval,
                created_at: now,
                updated_at: now,
            })
            .await?;
        debug!(item_id, thread_id, handle = %handle, position, "Approval handle registered");
        Ok(())
    }

    pub async fn resolve(&self, key: &ApprovalKey) -> Result<Option<ApprovalMapping>, DatabaseError> {
        match key {
            ApprovalKey::Handle(handle) => self.db.find_approval_by_handle(handle.as_str()).await,
            ApprovalKey::Item(item_id) => self.db.get_approval_mapping(item_id).await,
        }
    }

    pub async fn set_state(&self, item_id: &str, state: ApprovalState) -> Result<(), DatabaseError> {
        self.db.set_approval_state(item_id, state).await
    }

    /// Handles already delivered for a thread, in send order.
    pub async fn delivered_handles(&self, thread_id: &str) -> Result<Vec<MessageHandle>, DatabaseError> {
        Ok(self
            .db
            .list_approval_handles(thread_id)
            .await?
            .into_iter()
            .map(MessageHandle::from_raw)
            .collect())
    }

    pub fn parse_callback(&self, data: &str) -> Result<CallbackAction, WorkflowError> {
        parse_callback(data)
    }

    /// Open an edit ticket: the user's next text message on `channel_id`
    /// becomes the new draft.
    pub async fn open_edit(
        &self,
        mapping: &ApprovalMapping,
        channel_id: &str,
    ) -> Result<PendingEdit, DatabaseError> {
        let now = Utc::now();
        let edit = PendingEdit {
            user_id: mapping.user_id.clone(),
            channel_id: channel_id.to_string(),
            item_id: mapping.item_id.clone(),
            thread_id: mapping.thread_id.clone(),
            expires_at: now + self.edit_ttl,
            created_at: now,
        };
        self.db.put_pending_edit(&edit).await?;
        self.db
            .set_approval_state(&mapping.item_id, ApprovalState::AwaitingEdit)
            .await?;
        info!(item_id = %edit.item_id, thread_id = %edit.thread_id, "Edit ticket opened");
        Ok(edit)
    }

    /// Consume the open ticket for a channel. Expired tickets are dropped and
    /// their mapping returns to awaiting approval.
    pub async fn take_edit(&self, channel_id: &str) -> Result<Option<PendingEdit>, DatabaseError> {
        let Some(found) = self.db.find_pending_edit_by_channel(channel_id).await? else {
            return Ok(None);
        };
        let Some(edit) = self.db.take_pending_edit(&found.user_id).await? else {
            return Ok(None);
        };

        if edit.expires_at <= Utc::now() {
            info!(item_id = %edit.item_id, "Edit ticket expired");
            self.db
                .set_approval_state(&edit.item_id, ApprovalState::AwaitingApproval)
                .await?;
            return Ok(None);
        }
        Ok(Some(edit))
    }
}
