//! Node implementations.
//!
//! Each node reads the snapshot, talks to collaborators through
//! [`NodeContext`], and returns a [`SnapshotDelta`]. Side-effecting nodes check
//! their snapshot flag first so a re-run after a crash does not repeat work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::channels::{MailClient, MessageHandle, Notifier, split_message};
use crate::error::NodeError;
use crate::llm::prompts::{classification_prompt, draft_prompt};
use crate::llm::{ClassificationInput, LlmClassification, LlmClient};
use crate::retrieval::{ContextRetriever, IndexedDocument, RetrievalQuery};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::scoring::fallback::{Tone, classify_locally, detect_language, infer_tone, template_reply};
use crate::scoring::{PriorityScorer, UserRules};
use crate::store::{ApprovalState, Database, ItemStatus};
use crate::workflow::approval::{ApprovalGate, approval_buttons};
use crate::workflow::state::{
    Classification, ClassificationSource, NodeName, ResumeSignal, Snapshot, SnapshotDelta,
};

/// Characters of the body given to the priority scorer and the index.
const SNIPPET_CHARS: usize = 500;
/// Characters of the body shown in the approval prompt.
const PREVIEW_CHARS: usize = 600;
/// Confidence assumed when the model omits one.
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Everything a node may touch.
pub struct NodeContext {
    pub db: Arc<dyn Database>,
    pub mail: Arc<dyn MailClient>,
    pub llm: Arc<dyn LlmClient>,
    pub notifier: Arc<dyn Notifier>,
    pub retriever: Arc<ContextRetriever>,
    pub scorer: PriorityScorer,
    pub approvals: ApprovalGate,
    pub retry: RetryPolicy,
    /// Offered when the user has no categories of their own.
    pub default_categories: Vec<String>,
    pub default_category: String,
}

impl NodeContext {
    /// Build a context with the approval gate on the same store.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailClient>,
        llm: Arc<dyn LlmClient>,
        notifier: Arc<dyn Notifier>,
        retriever: Arc<ContextRetriever>,
        scorer: PriorityScorer,
        retry: RetryPolicy,
        default_categories: Vec<String>,
        default_category: String,
        edit_ttl: Duration,
    ) -> Self {
        Self {
            approvals: ApprovalGate::new(Arc::clone(&db), edit_ttl),
            db,
            mail,
            llm,
            notifier,
            retriever,
            scorer,
            retry,
            default_categories,
            default_category,
        }
    }

    /// Deterministic classification used when the model is unavailable or
    /// the instance aborts early.
    pub fn fallback_classification(&self, snapshot: &Snapshot, cause: &str) -> Classification {
        let options = if snapshot.category_options.is_empty() {
            &self.default_categories
        } else {
            &snapshot.category_options
        };
        classify_locally(
            &snapshot.sender,
            &snapshot.subject,
            &snapshot.body,
            options,
            &self.default_category,
            cause,
        )
        .into()
    }
}

/// Run one node.
pub async fn run(
    node: NodeName,
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    match node {
        NodeName::ExtractContext => extract_context(snapshot, ctx).await,
        NodeName::Classify => classify(snapshot, ctx).await,
        NodeName::DetectPriority => detect_priority(snapshot, ctx).await,
        NodeName::GenerateResponse => generate_response(snapshot, ctx).await,
        NodeName::Notify => notify(snapshot, ctx).await,
        NodeName::SendResponse => send_response(snapshot, ctx).await,
        NodeName::ExecuteAction => execute_action(snapshot, ctx).await,
        NodeName::Confirm => confirm(snapshot, ctx).await,
        NodeName::AwaitApproval | NodeName::End | NodeName::Failed => Ok(SnapshotDelta::default()),
    }
}

// ── Nodes ───────────────────────────────────────────────────────────

pub async fn extract_context(
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    let item = retry_with_backoff(&ctx.retry, "mail.fetch", || {
        ctx.mail.fetch(&snapshot.item_id)
    })
    .await?;

    let mut categories = ctx.db.list_categories(&item.user_id).await?;
    if categories.is_empty() {
        categories = ctx.default_categories.clone();
    }

    Ok(SnapshotDelta {
        channel_id: Some(item.channel_id),
        sender: Some(item.sender),
        subject: Some(item.subject),
        body: Some(item.body),
        received_at: Some(item.received_at),
        thread_ref: item.thread_ref,
        category_options: Some(categories),
        ..Default::default()
    })
}

pub async fn classify(snapshot: &Snapshot, ctx: &NodeContext) -> Result<SnapshotDelta, NodeError> {
    let input = ClassificationInput {
        sender: &snapshot.sender,
        subject: &snapshot.subject,
        body: &snapshot.body,
        category_options: &snapshot.category_options,
    };
    let prompt = classification_prompt(&input);

    let mut delta = SnapshotDelta::default();
    let classification = match retry_with_backoff(&ctx.retry, "llm.classify", || {
        ctx.llm.classify(&prompt)
    })
    .await
    {
        Ok(answer) => from_llm(answer, snapshot, ctx),
        Err(e) => {
            warn!(
                thread_id = %snapshot.thread_id,
                item_id = %snapshot.item_id,
                error = %e,
                "Classification failed, using local fallback"
            );
            let cause = e.to_string();
            delta.classification_error = Some(cause.clone());
            ctx.fallback_classification(snapshot, &cause)
        }
    };

    delta.proposed_category = Some(classification.category.clone());
    delta.classification = Some(classification);
    Ok(delta)
}

pub async fn detect_priority(
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    let user_rules = UserRules {
        important_contacts: ctx.db.list_important_contacts(&snapshot.user_id).await?,
    };
    let snippet: String = snapshot.body.chars().take(SNIPPET_CHARS).collect();
    let result = ctx
        .scorer
        .score(&snapshot.sender, &snapshot.subject, &snippet, &user_rules);

    Ok(SnapshotDelta {
        priority: Some(result),
        ..Default::default()
    })
}

pub async fn generate_response(
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    let classification = snapshot
        .classification
        .as_ref()
        .ok_or(NodeError::MissingState("classification"))?;

    let query = RetrievalQuery {
        item_id: snapshot.item_id.clone(),
        user_id: snapshot.user_id.clone(),
        thread_ref: snapshot.thread_ref.clone(),
        text: format!("{}\n{}", snapshot.subject, snapshot.body),
        now: Utc::now(),
    };
    let thread_length = ctx.retriever.thread_length(&query).await;
    let bundle = ctx.retriever.retrieve(&query, thread_length).await;

    let input = ClassificationInput {
        sender: &snapshot.sender,
        subject: &snapshot.subject,
        body: &snapshot.body,
        category_options: &snapshot.category_options,
    };
    let prompt = draft_prompt(
        &input,
        &classification.category,
        &classification.language,
        classification.tone.as_str(),
        snapshot.priority.as_ref(),
        &bundle,
    );

    let mut delta = SnapshotDelta {
        context: Some(bundle.summary()),
        ..Default::default()
    };
    let draft = match retry_with_backoff(&ctx.retry, "llm.generate", || ctx.llm.generate(&prompt))
        .await
    {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            delta.generation_error = Some("empty draft".into());
            local_draft(classification)
        }
        Err(e) => {
            warn!(
                thread_id = %snapshot.thread_id,
                item_id = %snapshot.item_id,
                error = %e,
                "Draft generation failed, using local draft"
            );
            delta.generation_error = Some(e.to_string());
            local_draft(classification)
        }
    };
    delta.draft = Some(draft);
    Ok(delta)
}

pub async fn notify(snapshot: &Snapshot, ctx: &NodeContext) -> Result<SnapshotDelta, NodeError> {
    if snapshot.notified {
        return Ok(SnapshotDelta::default());
    }

    let text = render_notification(snapshot);
    let chunks = split_message(&text, ctx.notifier.max_message_len());
    let buttons = approval_buttons(
        &snapshot.item_id,
        &snapshot.category_options,
        snapshot.proposed_category.as_deref(),
        snapshot.draft.is_some(),
    );

    let mut handles = ctx.approvals.delivered_handles(&snapshot.thread_id).await?;
    if !handles.is_empty() {
        info!(
            thread_id = %snapshot.thread_id,
            delivered = handles.len(),
            "Skipping already delivered notification chunks"
        );
    }

    let last = chunks.len().saturating_sub(1);
    for (position, chunk) in chunks.iter().enumerate().skip(handles.len()) {
        let rows: &[Vec<_>] = if position == last { &buttons } else { &[] };
        let handle: MessageHandle = retry_with_backoff(&ctx.retry, "notifier.send", || {
            ctx.notifier.send(&snapshot.channel_id, chunk, rows)
        })
        .await?;
        ctx.approvals
            .register(
                &snapshot.item_id,
                &snapshot.thread_id,
                &snapshot.user_id,
                &handle,
                position,
            )
            .await?;
        handles.push(handle);
    }

    info!(
        thread_id = %snapshot.thread_id,
        item_id = %snapshot.item_id,
        messages = handles.len(),
        "Approval requested"
    );
    Ok(SnapshotDelta {
        notification_handles: Some(handles.iter().map(|h| h.as_str().to_string()).collect()),
        notified: Some(true),
        ..Default::default()
    })
}

pub async fn send_response(
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    if snapshot.response_sent {
        return Ok(SnapshotDelta::default());
    }
    let draft = snapshot
        .draft
        .as_deref()
        .ok_or(NodeError::MissingState("draft"))?;

    retry_with_backoff(&ctx.retry, "mail.send_reply", || {
        ctx.mail.send_reply(&snapshot.item_id, draft)
    })
    .await?;
    info!(thread_id = %snapshot.thread_id, item_id = %snapshot.item_id, "Reply sent");

    Ok(SnapshotDelta {
        response_sent: Some(true),
        ..Default::default()
    })
}

pub async fn execute_action(
    snapshot: &Snapshot,
    ctx: &NodeContext,
) -> Result<SnapshotDelta, NodeError> {
    if snapshot.action_executed {
        return Ok(SnapshotDelta::default());
    }
    let category = snapshot
        .effective_category()
        .ok_or(NodeError::MissingState("category"))?;

    retry_with_backoff(&ctx.retry, "mail.apply_label", || {
        ctx.mail.apply_label(&snapshot.item_id, category)
    })
    .await?;
    ctx.db.set_item_category(&snapshot.item_id, category).await?;

    let snippet: String = snapshot.body.chars().take(SNIPPET_CHARS).collect();
    let document = IndexedDocument {
        item_id: snapshot.item_id.clone(),
        user_id: snapshot.user_id.clone(),
        thread_ref: snapshot.thread_ref.clone(),
        sender: snapshot.sender.clone(),
        subject: snapshot.subject.clone(),
        vector: ctx
            .retriever
            .embedder()
            .embed(&format!("{}\n{}", snapshot.subject, snapshot.body)),
        snippet,
        received_at: snapshot.received_at.unwrap_or_else(Utc::now),
    };
    if let Err(e) = retry_with_backoff(&ctx.retry, "index.upsert", || {
        ctx.retriever.index().upsert(document.clone())
    })
    .await
    {
        warn!(item_id = %snapshot.item_id, error = %e, "Indexing failed, continuing");
    }

    info!(
        thread_id = %snapshot.thread_id,
        item_id = %snapshot.item_id,
        category,
        "Action executed"
    );
    Ok(SnapshotDelta {
        action_executed: Some(true),
        ..Default::default()
    })
}

pub async fn confirm(snapshot: &Snapshot, ctx: &NodeContext) -> Result<SnapshotDelta, NodeError> {
    if snapshot.confirmed {
        return Ok(SnapshotDelta::default());
    }
    let rejected = matches!(snapshot.decision, Some(ResumeSignal::Reject));

    let text = confirmation_text(snapshot, rejected);
    if let Some(last) = snapshot.notification_handles.last() {
        let handle = MessageHandle::from_raw(last.as_str());
        if let Err(e) = retry_with_backoff(&ctx.retry, "notifier.edit", || {
            ctx.notifier.edit(&handle, &text)
        })
        .await
        {
            warn!(thread_id = %snapshot.thread_id, error = %e, "Could not update approval message");
        }
    }

    let (state, status) = if rejected {
        (ApprovalState::Rejected, ItemStatus::Rejected)
    } else {
        (ApprovalState::Completed, ItemStatus::Processed)
    };
    if snapshot.notified {
        ctx.approvals.set_state(&snapshot.item_id, state).await?;
    }
    ctx.db
        .update_item_status(&snapshot.item_id, status, None)
        .await?;

    Ok(SnapshotDelta {
        confirmed: Some(true),
        ..Default::default()
    })
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Normalize the model's answer against the available options.
fn from_llm(answer: LlmClassification, snapshot: &Snapshot, ctx: &NodeContext) -> Classification {
    let category = snapshot
        .category_options
        .iter()
        .find(|o| o.eq_ignore_ascii_case(answer.category.trim()))
        .cloned()
        .unwrap_or_else(|| {
            let fallback = ctx.fallback_classification(snapshot, "category not offered");
            warn!(
                item_id = %snapshot.item_id,
                answered = %answer.category,
                using = %fallback.category,
                "Model picked an unknown category"
            );
            fallback.category
        });

    let text = format!("{}\n{}", snapshot.subject, snapshot.body);
    let language = answer
        .language
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_lowercase())
        .unwrap_or_else(|| detect_language(&text).to_string());
    let tone = answer
        .tone
        .as_deref()
        .and_then(parse_tone)
        .unwrap_or_else(|| infer_tone(&snapshot.sender));

    Classification {
        category,
        reasoning: answer.reasoning,
        priority_hint: answer.priority_hint,
        needs_response: answer.needs_response,
        confidence: answer
            .confidence
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0),
        language,
        tone,
        draft: answer.draft.filter(|d| !d.trim().is_empty()),
        source: ClassificationSource::Llm,
    }
}

fn parse_tone(raw: &str) -> Option<Tone> {
    match raw.trim().to_lowercase().as_str() {
        "formal" => Some(Tone::Formal),
        "casual" => Some(Tone::Casual),
        "professional" => Some(Tone::Professional),
        _ => None,
    }
}

fn local_draft(classification: &Classification) -> String {
    classification
        .draft
        .clone()
        .unwrap_or_else(|| template_reply(&classification.language, classification.tone))
}

/// The approval prompt shown to the user.
pub fn render_notification(snapshot: &Snapshot) -> String {
    let mut out = String::with_capacity(1024);

    match &snapshot.priority {
        Some(p) if p.is_priority => out.push_str(&format!(
            "🔴 PRIORITY ({}) · {}\n",
            p.score,
            p.reason_names()
        )),
        _ => out.push_str("📨 New message\n"),
    }
    out.push_str(&format!("From: {}\n", snapshot.sender));
    out.push_str(&format!("Subject: {}\n", snapshot.subject));

    if let Some(c) = &snapshot.classification {
        let category = snapshot.proposed_category.as_deref().unwrap_or(&c.category);
        match c.source {
            ClassificationSource::Llm => out.push_str(&format!(
                "Category: {category} ({:.0}%)\n",
                c.confidence * 100.0
            )),
            ClassificationSource::Fallback => {
                out.push_str(&format!("Category: {category} (offline rules)\n"))
            }
        }
        if !c.reasoning.is_empty() {
            out.push_str(&format!("Why: {}\n", c.reasoning));
        }
    }

    let preview: String = snapshot.body.chars().take(PREVIEW_CHARS).collect();
    out.push_str(&format!("\n{preview}\n"));

    if let Some(draft) = &snapshot.draft {
        out.push_str(&format!("\nProposed reply:\n{draft}\n"));
    }
    out
}

fn confirmation_text(snapshot: &Snapshot, rejected: bool) -> String {
    if rejected {
        return format!("❌ Rejected: {}", snapshot.subject);
    }
    let category = snapshot.effective_category().unwrap_or("?");
    if snapshot.response_sent {
        format!("✅ Replied and filed under {category}: {}", snapshot.subject)
    } else {
        format!("✅ Filed under {category}: {}", snapshot.subject)
    }
}
