//! Error types for Inbox Flow.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Similarity index error: {0}")]
    Index(#[from] IndexError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Provider {provider} rejected the request: {reason}")]
    InvalidRequest { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Notification-channel errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Recipient {recipient} is unreachable: {reason}")]
    Unreachable { recipient: String, reason: String },

    #[error("Channel {name} rate limited, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Channel {name} timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("Network error on channel {name}: {reason}")]
    Network { name: String, reason: String },

    #[error("Channel {name} API error {status}: {reason}")]
    Api {
        name: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid message handle: {0}")]
    InvalidHandle(String),
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail item {item_id} not found")]
    NotFound { item_id: String },

    #[error("Mail provider unavailable: {0}")]
    Unavailable(String),

    #[error("Mail provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("Mail store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Similarity index errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Similarity index unavailable: {0}")]
    Unavailable(String),

    #[error("Similarity index timed out after {0:?}")]
    Timeout(Duration),

    #[error("Index store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Workflow orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Item {item_id} not found")]
    ItemNotFound { item_id: String },

    #[error("Item {item_id} is in status {status}, cannot {action}")]
    InvalidTransition {
        item_id: String,
        status: String,
        action: String,
    },

    #[error("Checkpoint write failed for {thread_id} at {node}: {reason}")]
    CheckpointWrite {
        thread_id: String,
        node: String,
        reason: String,
    },

    #[error("Unsupported snapshot version {found} (max supported {supported})")]
    UnsupportedSnapshot { found: u64, supported: u32 },

    #[error("Unrecognized callback payload: {0}")]
    UnknownCallback(String),
}

/// Failure of a single workflow node. Any of these aborts the instance.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Snapshot is missing {0}")]
    MissingState(&'static str),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
