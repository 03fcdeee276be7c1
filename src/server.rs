//! HTTP glue: item intake, manual retry and the Telegram webhook.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{InboundEvent, parse_update};
use crate::config::ServerConfig;
use crate::error::{DatabaseError, Error, WorkflowError};
use crate::store::NewItem;
use crate::workflow::{CallbackPayload, ResumeOutcome, WorkflowEngine};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

/// Build the router.
pub fn routes(engine: Arc<WorkflowEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/items", post(create_item))
        .route("/api/items/{id}/retry", post(retry_item))
        .route("/telegram/webhook", post(telegram_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(AppState { engine })
}

/// Bind and serve until the process exits.
pub async fn serve(config: &ServerConfig, engine: Arc<WorkflowEngine>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %config.bind_addr(), "HTTP server listening");
    axum::serve(listener, routes(engine)).await
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-flow"
    }))
}

// ── Items ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateItemRequest {
    /// Provider id; generated when absent. Re-posting the same id is a no-op.
    #[serde(default)]
    external_id: Option<String>,
    user_id: String,
    channel_id: String,
    sender: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    thread_ref: Option<String>,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

async fn create_item(
    State(state): State<AppState>,
    Json(req): Json<CreateItemRequest>,
) -> impl IntoResponse {
    let db = &state.engine.context().db;

    if let Some(external_id) = req.external_id.as_deref() {
        match db.get_item_by_external_id(external_id).await {
            Ok(Some(existing)) => {
                debug!(external_id, item_id = %existing.id, "Duplicate item ignored");
                return (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "item_id": existing.id,
                        "thread_id": existing.thread_id,
                        "duplicate": true,
                    })),
                );
            }
            Ok(None) => {}
            Err(e) => return error_response(&e.into()),
        }
    }

    let item = NewItem {
        external_id: req
            .external_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        user_id: req.user_id,
        channel_id: req.channel_id,
        sender: req.sender,
        subject: req.subject,
        body: req.body,
        thread_ref: req.thread_ref,
        received_at: req.received_at.unwrap_or_else(Utc::now),
    };
    let item_id = match db.insert_item(&item).await {
        Ok(id) => id,
        Err(e) => return error_response(&e.into()),
    };

    match state.engine.start(&item_id).await {
        Ok(thread_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "item_id": item_id, "thread_id": thread_id })),
        ),
        Err(e) => error_response(&e),
    }
}

async fn retry_item(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.manual_retry(&id).await {
        Ok(thread_id) => (
            StatusCode::OK,
            Json(serde_json::json!({ "item_id": id, "thread_id": thread_id })),
        ),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &Error) -> (StatusCode, Json<Value>) {
    let status = match e {
        Error::Workflow(WorkflowError::ItemNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Workflow(WorkflowError::InvalidTransition { .. })
        | Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "Request failed");
    }
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// ── Telegram webhook ────────────────────────────────────────────────

/// Always answers 200 so Telegram does not redeliver; work runs in the
/// background.
async fn telegram_webhook(State(state): State<AppState>, Json(update): Json<Value>) -> StatusCode {
    let Some(event) = parse_update(&update) else {
        return StatusCode::OK;
    };

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        match event {
            InboundEvent::Callback {
                callback_id,
                handle,
                data,
                ..
            } => {
                let payload = CallbackPayload {
                    message_handle: handle,
                    data,
                };
                let reply = match engine.resume_from_callback(&payload).await {
                    Ok(outcome) => {
                        info!(data = %payload.data, ?outcome, "Callback handled");
                        callback_reply(outcome)
                    }
                    Err(e) => {
                        warn!(data = %payload.data, error = %e, "Callback failed");
                        "Something went wrong"
                    }
                };
                if let Err(e) = engine
                    .context()
                    .notifier
                    .acknowledge(&callback_id, Some(reply))
                    .await
                {
                    debug!(error = %e, "Callback acknowledgement failed");
                }
            }
            InboundEvent::Text { chat_id, text } => {
                match engine.submit_edit(&chat_id, &text).await {
                    Ok(ResumeOutcome::NotFound) => {
                        debug!(chat_id = %chat_id, "Text message without an open edit ticket");
                    }
                    Ok(outcome) => info!(chat_id = %chat_id, ?outcome, "Edited reply applied"),
                    Err(e) => warn!(chat_id = %chat_id, error = %e, "Edited reply failed"),
                }
            }
        }
    });

    StatusCode::OK
}

fn callback_reply(outcome: ResumeOutcome) -> &'static str {
    match outcome {
        ResumeOutcome::Advanced(_) => "Done",
        ResumeOutcome::AlreadyAdvanced => "Already handled",
        ResumeOutcome::AwaitingEdit => "Send the new reply text",
        ResumeOutcome::NotFound => "This request is no longer active",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkflowStatus;

    #[test]
    fn error_statuses() {
        let missing: Error = WorkflowError::ItemNotFound {
            item_id: "x".into(),
        }
        .into();
        assert_eq!(error_response(&missing).0, StatusCode::NOT_FOUND);

        let conflict: Error = WorkflowError::InvalidTransition {
            item_id: "x".into(),
            status: "processed".into(),
            action: "retry".into(),
        }
        .into();
        assert_eq!(error_response(&conflict).0, StatusCode::CONFLICT);

        let db: Error = DatabaseError::Query("boom".into()).into();
        assert_eq!(error_response(&db).0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn callback_replies() {
        assert_eq!(
            callback_reply(ResumeOutcome::Advanced(WorkflowStatus::Completed)),
            "Done"
        );
        assert_eq!(callback_reply(ResumeOutcome::AlreadyAdvanced), "Already handled");
    }
}
