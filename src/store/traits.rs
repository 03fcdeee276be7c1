//! Unified `Database` trait, the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Lifecycle of an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Stored, no workflow has picked it up yet.
    Pending,
    /// A workflow is running for it.
    Processing,
    /// Suspended, waiting for the user.
    AwaitingApproval,
    /// Approved action was executed.
    Processed,
    /// User rejected the proposal.
    Rejected,
    /// Workflow aborted; eligible for manual retry.
    Error,
}

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

/// State label on an approval mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    AwaitingApproval,
    AwaitingEdit,
    Completed,
    Rejected,
}

/// Fields needed to store a new inbound item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub external_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub thread_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A persisted inbound item.
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub id: String,
    pub external_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub thread_ref: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub category: Option<String>,
    pub label: Option<String>,
    pub error_reason: Option<String>,
    /// Most recent workflow run for this item.
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reply that was sent for an item.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub id: String,
    pub item_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A prior message in the same conversation thread.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub item_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// An indexed message vector.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub item_id: String,
    pub user_id: String,
    pub thread_ref: Option<String>,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

/// A workflow instance row.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub thread_id: String,
    pub item_id: String,
    pub user_id: String,
    pub current_node: String,
    pub status: WorkflowStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A raw checkpoint row. `state` is the serialized snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub thread_id: String,
    pub sequence: i64,
    pub node_name: String,
    pub schema_version: u32,
    pub state: String,
    pub written_at: DateTime<Utc>,
}

/// Durable link between an item, its workflow and its notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalMapping {
    pub item_id: String,
    pub thread_id: String,
    pub user_id: String,
    /// Latest handle issued for the item.
    pub message_handle: String,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An open "edit draft" ticket waiting for the user's text reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub user_id: String,
    pub channel_id: String,
    pub item_id: String,
    pub thread_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Items ───────────────────────────────────────────────────────

    /// Insert a new item. Returns the generated id.
    async fn insert_item(&self, item: &NewItem) -> Result<String, DatabaseError>;

    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>, DatabaseError>;

    async fn get_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredItem>, DatabaseError>;

    /// Update status; `error_reason` replaces the stored reason (None clears it).
    async fn update_item_status(
        &self,
        id: &str,
        status: ItemStatus,
        error_reason: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Record the workflow run currently attached to the item.
    async fn set_item_thread(&self, id: &str, thread_id: &str) -> Result<(), DatabaseError>;

    async fn set_item_category(&self, id: &str, category: &str) -> Result<(), DatabaseError>;

    async fn set_item_label(&self, id: &str, label: &str) -> Result<(), DatabaseError>;

    /// Most recent `limit` messages of a thread, returned oldest first.
    async fn thread_history(
        &self,
        user_id: &str,
        thread_ref: &str,
        exclude_item_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, DatabaseError>;

    async fn count_thread_messages(
        &self,
        user_id: &str,
        thread_ref: &str,
        exclude_item_id: &str,
    ) -> Result<usize, DatabaseError>;

    // ── Outbox ──────────────────────────────────────────────────────

    async fn record_outbound_reply(
        &self,
        item_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, DatabaseError>;

    async fn list_outbound_replies(
        &self,
        item_id: &str,
    ) -> Result<Vec<OutboundReply>, DatabaseError>;

    // ── User rules ──────────────────────────────────────────────────

    async fn list_categories(&self, user_id: &str) -> Result<Vec<String>, DatabaseError>;

    async fn add_category(&self, user_id: &str, name: &str) -> Result<(), DatabaseError>;

    async fn list_important_contacts(&self, user_id: &str) -> Result<Vec<String>, DatabaseError>;

    async fn add_important_contact(&self, user_id: &str, contact: &str)
    -> Result<(), DatabaseError>;

    // ── Workflow instances ──────────────────────────────────────────

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), DatabaseError>;

    async fn update_instance(
        &self,
        thread_id: &str,
        current_node: &str,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn get_instance(&self, thread_id: &str)
    -> Result<Option<WorkflowInstance>, DatabaseError>;

    async fn list_instances_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Append a checkpoint in one statement. Returns the assigned sequence.
    async fn append_checkpoint(
        &self,
        thread_id: &str,
        node_name: &str,
        schema_version: u32,
        state: &str,
    ) -> Result<i64, DatabaseError>;

    async fn latest_checkpoint(
        &self,
        thread_id: &str,
    ) -> Result<Option<CheckpointRecord>, DatabaseError>;

    /// All checkpoints of a thread in sequence order.
    async fn list_checkpoints(&self, thread_id: &str)
    -> Result<Vec<CheckpointRecord>, DatabaseError>;

    // ── Approvals ───────────────────────────────────────────────────

    /// Insert or update the mapping for `mapping.item_id`.
    async fn upsert_approval_mapping(&self, mapping: &ApprovalMapping)
    -> Result<(), DatabaseError>;

    async fn get_approval_mapping(
        &self,
        item_id: &str,
    ) -> Result<Option<ApprovalMapping>, DatabaseError>;

    /// Record one issued handle. Re-recording the same handle is a no-op.
    async fn record_approval_handle(
        &self,
        handle: &str,
        item_id: &str,
        thread_id: &str,
        position: usize,
    ) -> Result<(), DatabaseError>;

    /// Resolve any handle ever issued. The returned mapping carries the
    /// thread the handle was issued for.
    async fn find_approval_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ApprovalMapping>, DatabaseError>;

    async fn set_approval_state(
        &self,
        item_id: &str,
        state: ApprovalState,
    ) -> Result<(), DatabaseError>;

    /// Handles issued for a thread, ordered by position.
    async fn list_approval_handles(&self, thread_id: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Pending edits ───────────────────────────────────────────────

    /// Open (or replace) the user's edit ticket.
    async fn put_pending_edit(&self, edit: &PendingEdit) -> Result<(), DatabaseError>;

    /// Remove and return the user's ticket.
    async fn take_pending_edit(&self, user_id: &str)
    -> Result<Option<PendingEdit>, DatabaseError>;

    async fn find_pending_edit_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<PendingEdit>, DatabaseError>;

    // ── Embeddings ──────────────────────────────────────────────────

    async fn upsert_embedding(&self, embedding: &StoredEmbedding) -> Result<(), DatabaseError>;

    async fn list_embeddings(
        &self,
        user_id: &str,
        received_after: Option<DateTime<Utc>>,
        exclude_item_id: Option<&str>,
    ) -> Result<Vec<StoredEmbedding>, DatabaseError>;
}
