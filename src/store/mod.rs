//! Persistence layer: libSQL-backed storage for items, workflows and approvals.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ApprovalMapping, ApprovalState, CheckpointRecord, Database, HistoryMessage, ItemStatus,
    NewItem, OutboundReply, PendingEdit, StoredEmbedding, StoredItem, WorkflowInstance,
    WorkflowStatus,
};
