//! End-to-end tests for the triage workflow.
//!
//! Each test wires a real `WorkflowEngine` to an in-memory (or temp-file)
//! libSQL store, the store-backed mail client and index, and stub LLM and
//! notifier implementations.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use inbox_flow::channels::{Button, MessageHandle, Notifier, StoredMailClient};
use inbox_flow::config::DEFAULT_CATEGORIES;
use inbox_flow::error::{Error, LlmError, NotifyError, WorkflowError};
use inbox_flow::llm::{LlmClassification, LlmClient, Prompt};
use inbox_flow::retrieval::{ContextRetriever, HashingEmbedder, RetrievalConfig, StoreIndex};
use inbox_flow::retry::RetryPolicy;
use inbox_flow::scoring::{PriorityScorer, ScoringRules};
use inbox_flow::store::{
    ApprovalState, Database, ItemStatus, LibSqlBackend, NewItem, WorkflowInstance,
};
use inbox_flow::workflow::{
    CallbackPayload, ClassificationSource, NodeContext, NodeName, ResumeOutcome, ResumeSignal,
    WorkflowEngine, WorkflowStatus,
};

// ── Stubs ───────────────────────────────────────────────────────────

enum LlmMode {
    /// Every call fails with a transient error.
    Unavailable,
    /// Every call is rejected permanently.
    InvalidRequest,
    /// Classification answers with the given category.
    Answers {
        category: &'static str,
        needs_response: bool,
    },
}

struct StubLlm {
    mode: LlmMode,
}

#[async_trait]
impl LlmClient for StubLlm {
    fn name(&self) -> &str {
        "stub"
    }

    async fn classify(&self, _prompt: &Prompt) -> Result<LlmClassification, LlmError> {
        match &self.mode {
            LlmMode::Unavailable => Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "connection refused".into(),
            }),
            LlmMode::InvalidRequest => Err(LlmError::InvalidRequest {
                provider: "stub".into(),
                reason: "content policy".into(),
            }),
            LlmMode::Answers {
                category,
                needs_response,
            } => Ok(LlmClassification {
                category: category.to_string(),
                reasoning: "stub reasoning".into(),
                priority_hint: Some("high".into()),
                needs_response: *needs_response,
                draft: None,
                confidence: Some(0.9),
                language: Some("en".into()),
                tone: Some("professional".into()),
            }),
        }
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String, LlmError> {
        match &self.mode {
            LlmMode::Unavailable => Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "connection refused".into(),
            }),
            LlmMode::InvalidRequest => Err(LlmError::InvalidRequest {
                provider: "stub".into(),
                reason: "content policy".into(),
            }),
            LlmMode::Answers { .. } => Ok("Generated reply".into()),
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, Vec<Vec<Button>>)>>,
    edits: Mutex<Vec<(MessageHandle, String)>>,
    next_id: AtomicI64,
}

impl RecordingNotifier {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn edit_texts(&self) -> Vec<String> {
        self.edits.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        buttons: &[Vec<Button>],
    ) -> Result<MessageHandle, NotifyError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string(), buttons.to_vec()));
        Ok(MessageHandle::new(channel_id, id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), NotifyError> {
        self.edits
            .lock()
            .unwrap()
            .push((handle.clone(), text.to_string()));
        Ok(())
    }

    async fn delete(&self, _handle: &MessageHandle) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A recipient that blocked the bot.
struct UnreachableNotifier;

#[async_trait]
impl Notifier for UnreachableNotifier {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn send(
        &self,
        channel_id: &str,
        _text: &str,
        _buttons: &[Vec<Button>],
    ) -> Result<MessageHandle, NotifyError> {
        Err(NotifyError::Unreachable {
            recipient: channel_id.to_string(),
            reason: "bot was blocked by the user".into(),
        })
    }

    async fn edit(&self, _handle: &MessageHandle, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn delete(&self, _handle: &MessageHandle) -> Result<(), NotifyError> {
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

const CHANNEL: &str = "4242";

async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

fn engine(db: &Arc<dyn Database>, llm: LlmMode, notifier: Arc<dyn Notifier>) -> WorkflowEngine {
    let retry = RetryPolicy::immediate(2);
    let retriever = Arc::new(ContextRetriever::new(
        Arc::clone(db),
        Arc::new(StoreIndex::new(Arc::clone(db))),
        Arc::new(HashingEmbedder::default()),
        RetrievalConfig::default(),
        retry.clone(),
    ));
    let ctx = NodeContext::new(
        Arc::clone(db),
        Arc::new(StoredMailClient::new(Arc::clone(db))),
        Arc::new(StubLlm { mode: llm }),
        notifier,
        retriever,
        PriorityScorer::new(ScoringRules::with_default_keywords().with_domains(["corp.example"])),
        retry,
        DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
        "Other".into(),
        Duration::from_secs(600),
    );
    WorkflowEngine::new(ctx)
}

async fn insert_item(db: &Arc<dyn Database>, sender: &str, subject: &str, body: &str) -> String {
    db.insert_item(&NewItem {
        external_id: uuid::Uuid::new_v4().to_string(),
        user_id: "user-1".into(),
        channel_id: CHANNEL.into(),
        sender: sender.into(),
        subject: subject.into(),
        body: body.into(),
        thread_ref: None,
        received_at: Utc::now(),
    })
    .await
    .unwrap()
}

async fn urgent_item(db: &Arc<dyn Database>) -> String {
    insert_item(
        db,
        "CEO <ceo@corp.example>",
        "URGENT: budget numbers",
        "Can you send me the final numbers today?",
    )
    .await
}

async fn latest_node(engine: &WorkflowEngine, thread_id: &str) -> NodeName {
    engine
        .checkpoints()
        .read_latest(thread_id)
        .await
        .unwrap()
        .unwrap()
        .node
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn priority_item_with_llm_down_suspends_then_reject_skips_execution() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(&db, LlmMode::Unavailable, notifier.clone());
    let item_id = urgent_item(&db).await;

    let thread_id = engine.start(&item_id).await.unwrap();

    let latest = engine
        .checkpoints()
        .read_latest(&thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.node, NodeName::AwaitApproval);
    let snapshot = latest.snapshot;

    let priority = snapshot.priority.as_ref().unwrap();
    assert_eq!(priority.score, 80);
    assert!(priority.is_priority);
    assert_eq!(priority.reasons.len(), 2);

    let classification = snapshot.classification.as_ref().unwrap();
    assert_eq!(classification.source, ClassificationSource::Fallback);
    assert!(classification.needs_response);
    assert_eq!(classification.confidence, 0.0);
    assert!(classification.reasoning.contains("connection refused"));
    assert!(snapshot.draft.is_some(), "fallback draft expected");
    assert!(snapshot.generation_error.is_some());

    let path: Vec<NodeName> = engine
        .checkpoints()
        .history(&thread_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.node)
        .collect();
    assert_eq!(
        path,
        vec![
            NodeName::ExtractContext,
            NodeName::Classify,
            NodeName::DetectPriority,
            NodeName::GenerateResponse,
            NodeName::Notify,
            NodeName::AwaitApproval,
        ]
    );

    assert_eq!(notifier.sent_count(), 1);
    let (channel, text, buttons) = notifier.sent.lock().unwrap()[0].clone();
    assert_eq!(channel, CHANNEL);
    assert!(text.contains("PRIORITY (80)"));
    assert_eq!(buttons[0][0].data, format!("a:{item_id}"));

    let item = db.get_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::AwaitingApproval);
    let instance = db.get_instance(&thread_id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Suspended);

    let outcome = engine.resume(&thread_id, ResumeSignal::Reject).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));

    let path: Vec<NodeName> = engine
        .checkpoints()
        .history(&thread_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.node)
        .collect();
    assert!(!path.contains(&NodeName::ExecuteAction));
    assert!(!path.contains(&NodeName::SendResponse));
    assert_eq!(&path[path.len() - 2..], &[NodeName::Confirm, NodeName::End]);

    let item = db.get_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Rejected);
    assert!(item.label.is_none());
    assert!(db.list_outbound_replies(&item_id).await.unwrap().is_empty());
    assert_eq!(
        db.get_approval_mapping(&item_id).await.unwrap().unwrap().state,
        ApprovalState::Rejected
    );
    assert!(notifier.edit_texts()[0].starts_with("❌"));
}

#[tokio::test]
async fn permanent_llm_rejection_falls_back_and_suspends() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(&db, LlmMode::InvalidRequest, notifier.clone());
    let item_id = insert_item(&db, "friend@gmail.com", "Dinner", "Are you free on Friday?").await;

    let thread_id = engine.start(&item_id).await.unwrap();

    let latest = engine
        .checkpoints()
        .read_latest(&thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.node, NodeName::AwaitApproval);
    let classification = latest.snapshot.classification.unwrap();
    assert_eq!(classification.confidence, 0.0);
    assert!(classification.reasoning.contains("content policy"));
    assert!(latest.snapshot.classification_error.is_some());
    assert_eq!(
        db.get_instance(&thread_id).await.unwrap().unwrap().status,
        WorkflowStatus::Suspended
    );
}

#[tokio::test]
async fn approve_sends_reply_and_files_item() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(
        &db,
        LlmMode::Answers {
            category: "work",
            needs_response: true,
        },
        notifier.clone(),
    );
    let item_id = insert_item(&db, "pm@vendor.example", "Project kickoff", "Can we meet Monday?").await;

    let thread_id = engine.start(&item_id).await.unwrap();
    let snapshot = engine
        .checkpoints()
        .read_latest(&thread_id)
        .await
        .unwrap()
        .unwrap()
        .snapshot;
    assert_eq!(snapshot.proposed_category.as_deref(), Some("Work"));
    assert_eq!(snapshot.draft.as_deref(), Some("Generated reply"));

    let outcome = engine
        .resume(&thread_id, ResumeSignal::Approve { edited_draft: None })
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));

    let replies = db.list_outbound_replies(&item_id).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, "Generated reply");
    let item = db.get_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Processed);
    assert_eq!(item.label.as_deref(), Some("Work"));
    assert_eq!(item.category.as_deref(), Some("Work"));
    assert_eq!(
        db.get_instance(&thread_id).await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn duplicate_resume_is_a_no_op() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(
        &db,
        LlmMode::Answers {
            category: "Work",
            needs_response: false,
        },
        notifier.clone(),
    );
    let item_id = insert_item(&db, "a@b.example", "FYI", "Status update attached.").await;
    let thread_id = engine.start(&item_id).await.unwrap();

    let approve = || ResumeSignal::Approve { edited_draft: None };
    let (first, second) = tokio::join!(
        engine.resume(&thread_id, approve()),
        engine.resume(&thread_id, approve())
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ResumeOutcome::AlreadyAdvanced));
    assert_eq!(
        outcomes,
        vec![
            ResumeOutcome::Advanced(WorkflowStatus::Completed),
            ResumeOutcome::AlreadyAdvanced
        ]
    );

    let again = engine.resume(&thread_id, approve()).await.unwrap();
    assert_eq!(again, ResumeOutcome::AlreadyAdvanced);

    assert_eq!(notifier.sent_count(), 1);
    assert_eq!(notifier.edit_texts().len(), 1);
    assert_eq!(latest_node(&engine, &thread_id).await, NodeName::End);
}

#[tokio::test]
async fn unknown_thread_is_not_found() {
    let db = memory_db().await;
    let engine = engine(&db, LlmMode::Unavailable, Arc::new(RecordingNotifier::default()));
    let outcome = engine.resume("no-such-thread", ResumeSignal::Reject).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::NotFound);
}

#[tokio::test]
async fn change_button_overrides_proposed_category() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(
        &db,
        LlmMode::Answers {
            category: "Work",
            needs_response: false,
        },
        notifier.clone(),
    );
    let item_id = insert_item(&db, "billing@shop.example", "Your order", "Thanks for shopping.").await;
    let thread_id = engine.start(&item_id).await.unwrap();

    let finance = DEFAULT_CATEGORIES.iter().position(|c| *c == "Finance").unwrap();
    let handle = MessageHandle::new(CHANNEL, 1);
    let outcome = engine
        .resume_from_callback(&CallbackPayload {
            message_handle: Some(handle),
            data: format!("c:{item_id}:{finance}"),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));

    let item = db.get_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.label.as_deref(), Some("Finance"));
    assert_eq!(item.status, ItemStatus::Processed);

    let snapshot = engine
        .checkpoints()
        .read_latest(&thread_id)
        .await
        .unwrap()
        .unwrap()
        .snapshot;
    assert_eq!(snapshot.proposed_category.as_deref(), Some("Work"));
    assert_eq!(snapshot.selected_category.as_deref(), Some("Finance"));
}

#[tokio::test]
async fn edit_button_then_text_sends_edited_reply() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(
        &db,
        LlmMode::Answers {
            category: "Work",
            needs_response: true,
        },
        notifier.clone(),
    );
    let item_id = insert_item(&db, "pm@vendor.example", "Contract", "Could you sign by Friday?").await;
    let thread_id = engine.start(&item_id).await.unwrap();

    let outcome = engine
        .resume_from_callback(&CallbackPayload {
            message_handle: None,
            data: format!("e:{item_id}"),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::AwaitingEdit);
    assert_eq!(
        db.get_approval_mapping(&item_id).await.unwrap().unwrap().state,
        ApprovalState::AwaitingEdit
    );
    // Prompt for the edited text.
    assert_eq!(notifier.sent_count(), 2);

    let outcome = engine
        .submit_edit(CHANNEL, "  Signed and attached.  ")
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));

    let replies = db.list_outbound_replies(&item_id).await.unwrap();
    assert_eq!(replies[0].body, "Signed and attached.");
    assert_eq!(latest_node(&engine, &thread_id).await, NodeName::End);

    assert_eq!(
        engine.submit_edit(CHANNEL, "late").await.unwrap(),
        ResumeOutcome::NotFound
    );
}

#[tokio::test]
async fn malformed_callback_is_an_error() {
    let db = memory_db().await;
    let engine = engine(&db, LlmMode::Unavailable, Arc::new(RecordingNotifier::default()));
    let err = engine
        .resume_from_callback(&CallbackPayload {
            message_handle: None,
            data: "zz".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Workflow(WorkflowError::UnknownCallback(_))));
}

#[tokio::test]
async fn suspended_workflow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.db");

    let (item_id, thread_id) = {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let engine = engine(&db, LlmMode::Unavailable, Arc::new(RecordingNotifier::default()));
        let item_id = urgent_item(&db).await;
        let thread_id = engine.start(&item_id).await.unwrap();
        (item_id, thread_id)
    };

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(&db, LlmMode::Unavailable, notifier.clone());

    assert_eq!(latest_node(&engine, &thread_id).await, NodeName::AwaitApproval);
    assert_eq!(engine.recover_interrupted().await.unwrap(), 0);

    let outcome = engine
        .resume(&thread_id, ResumeSignal::Approve { edited_draft: None })
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));
    assert_eq!(db.list_outbound_replies(&item_id).await.unwrap().len(), 1);
    assert_eq!(notifier.sent_count(), 0, "no duplicate notification after restart");
    assert_eq!(notifier.edit_texts().len(), 1);
}

#[tokio::test]
async fn interrupted_instance_is_recovered() {
    let db = memory_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = engine(&db, LlmMode::Unavailable, notifier.clone());
    let item_id = urgent_item(&db).await;

    let now = Utc::now();
    db.create_instance(&WorkflowInstance {
        thread_id: "crashed-thread".into(),
        item_id: item_id.clone(),
        user_id: "user-1".into(),
        current_node: "extract_context".into(),
        status: WorkflowStatus::Running,
        error: None,
        created_at: now,
        updated_at: now,
    })
    .await
    .unwrap();

    assert_eq!(engine.recover_interrupted().await.unwrap(), 1);
    assert_eq!(
        latest_node(&engine, "crashed-thread").await,
        NodeName::AwaitApproval
    );
    assert_eq!(
        db.get_instance("crashed-thread").await.unwrap().unwrap().status,
        WorkflowStatus::Suspended
    );
    assert_eq!(notifier.sent_count(), 1);
}

#[tokio::test]
async fn crash_after_send_does_not_notify_twice() {
    let db = memory_db().await;
    let answers = || LlmMode::Answers {
        category: "Work",
        needs_response: true,
    };
    let item_id = insert_item(&db, "pm@vendor.example", "Budget", "Can you review this?").await;

    // A completed run supplies a realistic state as of `generate_response`.
    let first = engine(&db, answers(), Arc::new(RecordingNotifier::default()));
    let template_thread = first.start(&item_id).await.unwrap();
    let mut snapshot = first
        .checkpoints()
        .history(&template_thread)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.node == NodeName::GenerateResponse)
        .unwrap()
        .snapshot;
    assert!(!snapshot.notified);

    // The process died after the notification went out but before the
    // notify checkpoint was written.
    let thread_id = "crashed-after-send";
    snapshot.thread_id = thread_id.to_string();
    let now = Utc::now();
    db.create_instance(&WorkflowInstance {
        thread_id: thread_id.into(),
        item_id: item_id.clone(),
        user_id: "user-1".into(),
        current_node: "notify".into(),
        status: WorkflowStatus::Running,
        error: None,
        created_at: now,
        updated_at: now,
    })
    .await
    .unwrap();
    first
        .checkpoints()
        .write(thread_id, NodeName::GenerateResponse, &snapshot)
        .await
        .unwrap();
    let delivered = MessageHandle::new(CHANNEL, 999);
    first
        .context()
        .approvals
        .register(&item_id, thread_id, "user-1", &delivered, 0)
        .await
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let restarted = engine(&db, answers(), notifier.clone());
    assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);

    assert_eq!(notifier.sent_count(), 0);
    let latest = restarted
        .checkpoints()
        .read_latest(thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.node, NodeName::AwaitApproval);
    assert!(latest.snapshot.notified);
    assert_eq!(
        latest.snapshot.notification_handles,
        vec![delivered.as_str().to_string()]
    );
    assert_eq!(
        db.get_instance(thread_id).await.unwrap().unwrap().status,
        WorkflowStatus::Suspended
    );

    // The delivered button still resumes the recovered thread.
    let outcome = restarted
        .resume_from_callback(&CallbackPayload {
            message_handle: Some(delivered),
            data: format!("a:{item_id}"),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResumeOutcome::Advanced(WorkflowStatus::Completed));
    assert_eq!(latest_node(&restarted, thread_id).await, NodeName::End);
}

#[tokio::test]
async fn unreachable_recipient_fails_item_and_manual_retry_starts_fresh() {
    let db = memory_db().await;
    let broken = engine(&db, LlmMode::Unavailable, Arc::new(UnreachableNotifier));
    let item_id = urgent_item(&db).await;

    let failed_thread = broken.start(&item_id).await.unwrap();

    let latest = broken
        .checkpoints()
        .read_latest(&failed_thread)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.node, NodeName::Failed);
    assert!(latest.snapshot.classification.is_some());
    assert!(latest.snapshot.error.as_deref().unwrap().starts_with("notify"));

    let item = db.get_item(&item_id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Error);
    assert!(item.error_reason.unwrap().contains("unreachable"));
    assert_eq!(
        db.get_instance(&failed_thread).await.unwrap().unwrap().status,
        WorkflowStatus::Failed
    );

    let notifier = Arc::new(RecordingNotifier::default());
    let fixed = engine(&db, LlmMode::Unavailable, notifier.clone());
    let new_thread = fixed.manual_retry(&item_id).await.unwrap();
    assert_ne!(new_thread, failed_thread);
    assert_eq!(latest_node(&fixed, &new_thread).await, NodeName::AwaitApproval);
    assert_eq!(notifier.sent_count(), 1);

    // The old run stays failed and cannot be resumed.
    assert_eq!(
        fixed.resume(&failed_thread, ResumeSignal::Reject).await.unwrap(),
        ResumeOutcome::AlreadyAdvanced
    );

    let err = fixed.manual_retry(&item_id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Workflow(WorkflowError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn missing_item_cannot_start() {
    let db = memory_db().await;
    let engine = engine(&db, LlmMode::Unavailable, Arc::new(RecordingNotifier::default()));
    let err = engine.start("missing").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Workflow(WorkflowError::ItemNotFound { .. })
    ));
}
