//! libSQL backend for the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ApprovalMapping, ApprovalState, CheckpointRecord, Database, HistoryMessage, ItemStatus,
    NewItem, OutboundReply, PendingEdit, StoredEmbedding, StoredItem, WorkflowInstance,
    WorkflowStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

pub(crate) fn item_status_to_str(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Pending => "pending",
        ItemStatus::Processing => "processing",
        ItemStatus::AwaitingApproval => "awaiting_approval",
        ItemStatus::Processed => "processed",
        ItemStatus::Rejected => "rejected",
        ItemStatus::Error => "error",
    }
}

fn str_to_item_status(s: &str) -> ItemStatus {
    match s {
        "processing" => ItemStatus::Processing,
        "awaiting_approval" => ItemStatus::AwaitingApproval,
        "processed" => ItemStatus::Processed,
        "rejected" => ItemStatus::Rejected,
        "error" => ItemStatus::Error,
        _ => ItemStatus::Pending,
    }
}

fn workflow_status_to_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "running",
        WorkflowStatus::Suspended => "suspended",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
    }
}

fn str_to_workflow_status(s: &str) -> WorkflowStatus {
    match s {
        "suspended" => WorkflowStatus::Suspended,
        "completed" => WorkflowStatus::Completed,
        "failed" => WorkflowStatus::Failed,
        _ => WorkflowStatus::Running,
    }
}

fn approval_state_to_str(state: ApprovalState) -> &'static str {
    match state {
        ApprovalState::AwaitingApproval => "awaiting_approval",
        ApprovalState::AwaitingEdit => "awaiting_edit",
        ApprovalState::Completed => "completed",
        ApprovalState::Rejected => "rejected",
    }
}

fn str_to_approval_state(s: &str) -> ApprovalState {
    match s {
        "awaiting_edit" => ApprovalState::AwaitingEdit,
        "completed" => ApprovalState::Completed,
        "rejected" => ApprovalState::Rejected,
        _ => ApprovalState::AwaitingApproval,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map an insert error, surfacing uniqueness violations as `Constraint`.
fn insert_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const ITEM_COLUMNS: &str = "id, external_id, user_id, channel_id, sender, subject, body, thread_ref, received_at, status, category, label, error_reason, thread_id, created_at, updated_at";

const INSTANCE_COLUMNS: &str =
    "thread_id, item_id, user_id, current_node, status, error, created_at, updated_at";

const CHECKPOINT_COLUMNS: &str = "thread_id, sequence, node_name, schema_version, state, written_at";

const MAPPING_COLUMNS: &str =
    "item_id, thread_id, user_id, message_handle, state_label, created_at, updated_at";

const EDIT_COLUMNS: &str = "user_id, channel_id, item_id, thread_id, expires_at, created_at";

const EMBEDDING_COLUMNS: &str =
    "item_id, user_id, thread_ref, sender, subject, snippet, received_at, vector";

fn row_to_item(row: &libsql::Row) -> Result<StoredItem, libsql::Error> {
    let received_str: String = row.get(8)?;
    let status_str: String = row.get(9)?;
    let created_str: String = row.get(14)?;
    let updated_str: String = row.get(15)?;

    Ok(StoredItem {
        id: row.get(0)?,
        external_id: row.get(1)?,
        user_id: row.get(2)?,
        channel_id: row.get(3)?,
        sender: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        thread_ref: row.get(7).ok(),
        received_at: parse_datetime(&received_str),
        status: str_to_item_status(&status_str),
        category: row.get(10).ok(),
        label: row.get(11).ok(),
        error_reason: row.get(12).ok(),
        thread_id: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_instance(row: &libsql::Row) -> Result<WorkflowInstance, libsql::Error> {
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;
    Ok(WorkflowInstance {
        thread_id: row.get(0)?,
        item_id: row.get(1)?,
        user_id: row.get(2)?,
        current_node: row.get(3)?,
        status: str_to_workflow_status(&status_str),
        error: row.get(5).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<CheckpointRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let version: i64 = row.get(3).map_err(parse)?;
    let schema_version = u32::try_from(version).map_err(|_| {
        DatabaseError::Serialization(format!("checkpoint schema version out of range: {version}"))
    })?;
    let written_str: String = row.get(5).map_err(parse)?;
    Ok(CheckpointRecord {
        thread_id: row.get(0).map_err(parse)?,
        sequence: row.get(1).map_err(parse)?,
        node_name: row.get(2).map_err(parse)?,
        schema_version,
        state: row.get(4).map_err(parse)?,
        written_at: parse_datetime(&written_str),
    })
}

fn row_to_mapping(row: &libsql::Row) -> Result<ApprovalMapping, libsql::Error> {
    let state_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;
    Ok(ApprovalMapping {
        item_id: row.get(0)?,
        thread_id: row.get(1)?,
        user_id: row.get(2)?,
        message_handle: row.get(3)?,
        state: str_to_approval_state(&state_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_edit(row: &libsql::Row) -> Result<PendingEdit, libsql::Error> {
    let expires_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    Ok(PendingEdit {
        user_id: row.get(0)?,
        channel_id: row.get(1)?,
        item_id: row.get(2)?,
        thread_id: row.get(3)?,
        expires_at: parse_datetime(&expires_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_embedding(row: &libsql::Row) -> Result<StoredEmbedding, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let received_str: String = row.get(6).map_err(map)?;
    let vector_str: String = row.get(7).map_err(map)?;
    let vector: Vec<f32> = serde_json::from_str(&vector_str)
        .map_err(|e| DatabaseError::Serialization(format!("embedding vector: {e}")))?;
    Ok(StoredEmbedding {
        item_id: row.get(0).map_err(map)?,
        user_id: row.get(1).map_err(map)?,
        thread_ref: row.get(2).ok(),
        sender: row.get(3).map_err(map)?,
        subject: row.get(4).map_err(map)?,
        snippet: row.get(5).map_err(map)?,
        received_at: parse_datetime(&received_str),
        vector,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Items ───────────────────────────────────────────────────────

    async fn insert_item(&self, item: &NewItem) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO items (id, external_id, user_id, channel_id, sender, subject, body,
                    thread_ref, received_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?10)",
                params![
                    id.clone(),
                    item.external_id.as_str(),
                    item.user_id.as_str(),
                    item.channel_id.as_str(),
                    item.sender.as_str(),
                    item.subject.as_str(),
                    item.body.as_str(),
                    opt_text(item.thread_ref.as_deref()),
                    item.received_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| insert_error("insert_item", e))?;

        debug!(id = %id, external_id = %item.external_id, "Item inserted into DB");
        Ok(id)
    }

    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item =
                    row_to_item(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_item: {e}"))),
        }
    }

    async fn get_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item =
                    row_to_item(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_item_by_external_id: {e}"
            ))),
        }
    }

    async fn update_item_status(
        &self,
        id: &str,
        status: ItemStatus,
        error_reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE items SET status = ?1, error_reason = ?2, updated_at = ?3 WHERE id = ?4",
                params![item_status_to_str(status), opt_text(error_reason), now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_item_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "item".into(),
                id: id.into(),
            });
        }
        debug!(id = id, status = ?status, "Item status updated in DB");
        Ok(())
    }

    async fn set_item_thread(&self, id: &str, thread_id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE items SET thread_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![thread_id, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_item_thread: {e}")))?;
        Ok(())
    }

    async fn set_item_category(&self, id: &str, category: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE items SET category = ?1, updated_at = ?2 WHERE id = ?3",
                params![category, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_item_category: {e}")))?;
        Ok(())
    }

    async fn set_item_label(&self, id: &str, label: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE items SET label = ?1, updated_at = ?2 WHERE id = ?3",
                params![label, now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_item_label: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "item".into(),
                id: id.into(),
            });
        }
        Ok(())
    }

    async fn thread_history(
        &self,
        user_id: &str,
        thread_ref: &str,
        exclude_item_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, sender, subject, body, received_at FROM items
                 WHERE user_id = ?1 AND thread_ref = ?2 AND id != ?3
                 ORDER BY received_at DESC LIMIT ?4",
                params![user_id, thread_ref, exclude_item_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("thread_history: {e}")))?;

        let mut history = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = (|| -> Result<HistoryMessage, libsql::Error> {
                let received_str: String = row.get(4)?;
                Ok(HistoryMessage {
                    item_id: row.get(0)?,
                    sender: row.get(1)?,
                    subject: row.get(2)?,
                    body: row.get(3)?,
                    received_at: parse_datetime(&received_str),
                })
            })();
            match parsed {
                Ok(msg) => history.push(msg),
                Err(e) => warn!("Skipping history row: {e}"),
            }
        }
        history.reverse();
        Ok(history)
    }

    async fn count_thread_messages(
        &self,
        user_id: &str,
        thread_ref: &str,
        exclude_item_id: &str,
    ) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM items WHERE user_id = ?1 AND thread_ref = ?2 AND id != ?3",
                params![user_id, thread_ref, exclude_item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_thread_messages: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_thread_messages: {e}"))),
        }
    }

    // ── Outbox ──────────────────────────────────────────────────────

    async fn record_outbound_reply(
        &self,
        item_id: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO outbound_replies (id, item_id, recipient, subject, body, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.clone(),
                    item_id,
                    recipient,
                    subject,
                    body,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_outbound_reply: {e}")))?;
        Ok(id)
    }

    async fn list_outbound_replies(
        &self,
        item_id: &str,
    ) -> Result<Vec<OutboundReply>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, item_id, recipient, subject, body, sent_at FROM outbound_replies
                 WHERE item_id = ?1 ORDER BY sent_at ASC",
                params![item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outbound_replies: {e}")))?;

        let mut replies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = (|| -> Result<OutboundReply, libsql::Error> {
                let sent_str: String = row.get(5)?;
                Ok(OutboundReply {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    recipient: row.get(2)?,
                    subject: row.get(3)?,
                    body: row.get(4)?,
                    sent_at: parse_datetime(&sent_str),
                })
            })();
            match parsed {
                Ok(reply) => replies.push(reply),
                Err(e) => warn!("Skipping outbound row: {e}"),
            }
        }
        Ok(replies)
    }

    // ── User rules ──────────────────────────────────────────────────

    async fn list_categories(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name FROM categories WHERE user_id = ?1 ORDER BY created_at, name",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_categories: {e}")))?;

        let mut names = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(name) = row.get::<String>(0) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn add_category(&self, user_id: &str, name: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO categories (user_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, name, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_category: {e}")))?;
        Ok(())
    }

    async fn list_important_contacts(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT contact FROM priority_contacts WHERE user_id = ?1 ORDER BY contact",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_important_contacts: {e}")))?;

        let mut contacts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(contact) = row.get::<String>(0) {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    async fn add_important_contact(
        &self,
        user_id: &str,
        contact: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO priority_contacts (user_id, contact) VALUES (?1, ?2)",
                params![user_id, contact.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_important_contact: {e}")))?;
        Ok(())
    }

    // ── Workflow instances ──────────────────────────────────────────

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workflow_instances (thread_id, item_id, user_id, current_node,
                    status, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    instance.thread_id.as_str(),
                    instance.item_id.as_str(),
                    instance.user_id.as_str(),
                    instance.current_node.as_str(),
                    workflow_status_to_str(instance.status),
                    opt_text(instance.error.as_deref()),
                    instance.created_at.to_rfc3339(),
                    instance.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| insert_error("create_instance", e))?;
        debug!(thread_id = %instance.thread_id, item_id = %instance.item_id, "Workflow instance created");
        Ok(())
    }

    async fn update_instance(
        &self,
        thread_id: &str,
        current_node: &str,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE workflow_instances SET current_node = ?1, status = ?2, error = ?3,
                    updated_at = ?4 WHERE thread_id = ?5",
                params![
                    current_node,
                    workflow_status_to_str(status),
                    opt_text(error),
                    Utc::now().to_rfc3339(),
                    thread_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_instance: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "workflow_instance".into(),
                id: thread_id.into(),
            });
        }
        Ok(())
    }

    async fn get_instance(
        &self,
        thread_id: &str,
    ) -> Result<Option<WorkflowInstance>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE thread_id = ?1"),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_instance: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_instance(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_instance: {e}"))),
        }
    }

    async fn list_instances_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE status = ?1 ORDER BY created_at"
                ),
                params![workflow_status_to_str(status)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_instances_by_status: {e}")))?;

        let mut instances = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_instance(&row) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping instance row: {e}"),
            }
        }
        Ok(instances)
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn append_checkpoint(
        &self,
        thread_id: &str,
        node_name: &str,
        schema_version: u32,
        state: &str,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO checkpoints (thread_id, sequence, node_name, schema_version, state, written_at)
                 SELECT ?1, COALESCE(MAX(sequence), 0) + 1, ?2, ?3, ?4, ?5
                 FROM checkpoints WHERE thread_id = ?1
                 RETURNING sequence",
                params![
                    thread_id,
                    node_name,
                    schema_version as i64,
                    state,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| insert_error("append_checkpoint", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let sequence: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(sequence)
            }
            Ok(None) => Err(DatabaseError::Query(
                "append_checkpoint: no sequence returned".into(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("append_checkpoint: {e}"))),
        }
    }

    async fn latest_checkpoint(
        &self,
        thread_id: &str,
    ) -> Result<Option<CheckpointRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ?1
                     ORDER BY sequence DESC LIMIT 1"
                ),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_checkpoint: {e}"))),
        }
    }

    async fn list_checkpoints(
        &self,
        thread_id: &str,
    ) -> Result<Vec<CheckpointRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ?1 ORDER BY sequence"
                ),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints: {e}")))?;

        let mut checkpoints = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_checkpoint(&row) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!("Skipping checkpoint row: {e}"),
            }
        }
        Ok(checkpoints)
    }

    // ── Approvals ───────────────────────────────────────────────────

    async fn upsert_approval_mapping(
        &self,
        mapping: &ApprovalMapping,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO approval_mappings (item_id, thread_id, user_id, message_handle,
                    state_label, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (item_id) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    message_handle = excluded.message_handle,
                    state_label = excluded.state_label,
                    updated_at = excluded.updated_at",
                params![
                    mapping.item_id.as_str(),
                    mapping.thread_id.as_str(),
                    mapping.user_id.as_str(),
                    mapping.message_handle.as_str(),
                    approval_state_to_str(mapping.state),
                    mapping.created_at.to_rfc3339(),
                    mapping.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_approval_mapping: {e}")))?;
        Ok(())
    }

    async fn get_approval_mapping(
        &self,
        item_id: &str,
    ) -> Result<Option<ApprovalMapping>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAPPING_COLUMNS} FROM approval_mappings WHERE item_id = ?1"),
                params![item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_approval_mapping: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_mapping(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_approval_mapping: {e}"))),
        }
    }

    async fn record_approval_handle(
        &self,
        handle: &str,
        item_id: &str,
        thread_id: &str,
        position: usize,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO approval_handles (message_handle, item_id, thread_id, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    handle,
                    item_id,
                    thread_id,
                    position as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_approval_handle: {e}")))?;
        Ok(())
    }

    async fn find_approval_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ApprovalMapping>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT m.item_id, h.thread_id, m.user_id, h.message_handle, m.state_label,
                        m.created_at, m.updated_at
                 FROM approval_handles h JOIN approval_mappings m ON m.item_id = h.item_id
                 WHERE h.message_handle = ?1",
                params![handle],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_approval_by_handle: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_mapping(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_approval_by_handle: {e}"))),
        }
    }

    async fn set_approval_state(
        &self,
        item_id: &str,
        state: ApprovalState,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE approval_mappings SET state_label = ?1, updated_at = ?2 WHERE item_id = ?3",
                params![
                    approval_state_to_str(state),
                    Utc::now().to_rfc3339(),
                    item_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_approval_state: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "approval_mapping".into(),
                id: item_id.into(),
            });
        }
        Ok(())
    }

    async fn list_approval_handles(&self, thread_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_handle FROM approval_handles WHERE thread_id = ?1 ORDER BY position",
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_approval_handles: {e}")))?;

        let mut handles = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(handle) = row.get::<String>(0) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    // ── Pending edits ───────────────────────────────────────────────

    async fn put_pending_edit(&self, edit: &PendingEdit) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO pending_edits (user_id, channel_id, item_id, thread_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    item_id = excluded.item_id,
                    thread_id = excluded.thread_id,
                    expires_at = excluded.expires_at,
                    created_at = excluded.created_at",
                params![
                    edit.user_id.as_str(),
                    edit.channel_id.as_str(),
                    edit.item_id.as_str(),
                    edit.thread_id.as_str(),
                    edit.expires_at.to_rfc3339(),
                    edit.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_pending_edit: {e}")))?;
        Ok(())
    }

    async fn take_pending_edit(
        &self,
        user_id: &str,
    ) -> Result<Option<PendingEdit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("DELETE FROM pending_edits WHERE user_id = ?1 RETURNING {EDIT_COLUMNS}"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("take_pending_edit: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_edit(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("take_pending_edit: {e}"))),
        }
    }

    async fn find_pending_edit_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<PendingEdit>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EDIT_COLUMNS} FROM pending_edits WHERE channel_id = ?1
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_pending_edit_by_channel: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_edit(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_pending_edit_by_channel: {e}"
            ))),
        }
    }

    // ── Embeddings ──────────────────────────────────────────────────

    async fn upsert_embedding(&self, embedding: &StoredEmbedding) -> Result<(), DatabaseError> {
        let vector = serde_json::to_string(&embedding.vector)
            .map_err(|e| DatabaseError::Serialization(format!("embedding vector: {e}")))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO message_embeddings ({EMBEDDING_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    embedding.item_id.as_str(),
                    embedding.user_id.as_str(),
                    opt_text(embedding.thread_ref.as_deref()),
                    embedding.sender.as_str(),
                    embedding.subject.as_str(),
                    embedding.snippet.as_str(),
                    embedding.received_at.to_rfc3339(),
                    vector,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_embedding: {e}")))?;
        Ok(())
    }

    async fn list_embeddings(
        &self,
        user_id: &str,
        received_after: Option<DateTime<Utc>>,
        exclude_item_id: Option<&str>,
    ) -> Result<Vec<StoredEmbedding>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EMBEDDING_COLUMNS} FROM message_embeddings
                     WHERE user_id = ?1 AND item_id != ?2"
                ),
                params![user_id, exclude_item_id.unwrap_or("")],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_embeddings: {e}")))?;

        let mut embeddings = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_embedding(&row) {
                Ok(e) if received_after.is_none_or(|since| e.received_at >= since) => {
                    embeddings.push(e)
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping embedding row: {e}"),
            }
        }
        Ok(embeddings)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
