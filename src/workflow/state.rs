//! Workflow state: node names, the versioned snapshot, and resume signals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, Error, WorkflowError};
use crate::retrieval::ContextSummary;
use crate::scoring::PriorityResult;
use crate::scoring::fallback::{FallbackClassification, Tone};

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A node in the triage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeName {
    ExtractContext,
    Classify,
    DetectPriority,
    GenerateResponse,
    Notify,
    AwaitApproval,
    SendResponse,
    ExecuteAction,
    Confirm,
    End,
    /// Pseudo-node recorded when an instance aborts.
    Failed,
}

impl NodeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractContext => "extract_context",
            Self::Classify => "classify",
            Self::DetectPriority => "detect_priority",
            Self::GenerateResponse => "generate_response",
            Self::Notify => "notify",
            Self::AwaitApproval => "await_approval",
            Self::SendResponse => "send_response",
            Self::ExecuteAction => "execute_action",
            Self::Confirm => "confirm",
            Self::End => "end",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "extract_context" => Self::ExtractContext,
            "classify" => Self::Classify,
            "detect_priority" => Self::DetectPriority,
            "generate_response" => Self::GenerateResponse,
            "notify" => Self::Notify,
            "await_approval" => Self::AwaitApproval,
            "send_response" => Self::SendResponse,
            "execute_action" => Self::ExecuteAction,
            "confirm" => Self::Confirm,
            "end" => Self::End,
            "failed" => Self::Failed,
            other => {
                return Err(DatabaseError::Serialization(format!(
                    "unknown node name '{other}'"
                )));
            }
        })
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Llm,
    Fallback,
}

/// The classification carried in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub reasoning: String,
    /// Informational; `is_priority` comes from the rule scorer only.
    pub priority_hint: Option<String>,
    pub needs_response: bool,
    pub confidence: f32,
    pub language: String,
    pub tone: Tone,
    pub draft: Option<String>,
    pub source: ClassificationSource,
}

impl From<FallbackClassification> for Classification {
    fn from(f: FallbackClassification) -> Self {
        Self {
            category: f.category,
            reasoning: f.reasoning,
            priority_hint: None,
            needs_response: f.needs_response,
            confidence: 0.0,
            language: f.language,
            tone: f.tone,
            draft: None,
            source: ClassificationSource::Fallback,
        }
    }
}

/// The user's decision on a suspended workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResumeSignal {
    Approve { edited_draft: Option<String> },
    Change { category: String },
    Reject,
}

impl ResumeSignal {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Change { .. } => "change",
            Self::Reject => "reject",
        }
    }
}

/// Everything a workflow knows, persisted after every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub thread_id: String,
    pub item_id: String,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thread_ref: Option<String>,
    #[serde(default)]
    pub category_options: Vec<String>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub priority: Option<PriorityResult>,
    #[serde(default)]
    pub proposed_category: Option<String>,
    #[serde(default)]
    pub selected_category: Option<String>,
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default)]
    pub context: Option<ContextSummary>,
    #[serde(default)]
    pub notification_handles: Vec<String>,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub decision: Option<ResumeSignal>,
    #[serde(default)]
    pub response_sent: bool,
    #[serde(default)]
    pub action_executed: bool,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub classification_error: Option<String>,
    #[serde(default)]
    pub generation_error: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Snapshot {
    /// A fresh snapshot; message fields are filled by `extract_context`.
    pub fn new(thread_id: &str, item_id: &str, user_id: &str, channel_id: &str) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            thread_id: thread_id.to_string(),
            item_id: item_id.to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            sender: String::new(),
            subject: String::new(),
            body: String::new(),
            received_at: None,
            thread_ref: None,
            category_options: Vec::new(),
            classification: None,
            priority: None,
            proposed_category: None,
            selected_category: None,
            draft: None,
            context: None,
            notification_handles: Vec::new(),
            notified: false,
            decision: None,
            response_sent: false,
            action_executed: false,
            confirmed: false,
            classification_error: None,
            generation_error: None,
            error: None,
        }
    }

    /// Merge a node's output.
    pub fn apply(&mut self, delta: SnapshotDelta) {
        if let Some(v) = delta.channel_id {
            self.channel_id = v;
        }
        if let Some(v) = delta.sender {
            self.sender = v;
        }
        if let Some(v) = delta.subject {
            self.subject = v;
        }
        if let Some(v) = delta.body {
            self.body = v;
        }
        if let Some(v) = delta.received_at {
            self.received_at = Some(v);
        }
        if let Some(v) = delta.thread_ref {
            self.thread_ref = Some(v);
        }
        if let Some(v) = delta.category_options {
            self.category_options = v;
        }
        if let Some(v) = delta.classification {
            self.classification = Some(v);
        }
        if let Some(v) = delta.priority {
            self.priority = Some(v);
        }
        if let Some(v) = delta.proposed_category {
            self.proposed_category = Some(v);
        }
        if let Some(v) = delta.draft {
            self.draft = Some(v);
        }
        if let Some(v) = delta.context {
            self.context = Some(v);
        }
        if let Some(v) = delta.notification_handles {
            self.notification_handles = v;
        }
        if let Some(v) = delta.notified {
            self.notified = v;
        }
        if let Some(v) = delta.response_sent {
            self.response_sent = v;
        }
        if let Some(v) = delta.action_executed {
            self.action_executed = v;
        }
        if let Some(v) = delta.confirmed {
            self.confirmed = v;
        }
        if let Some(v) = delta.classification_error {
            self.classification_error = Some(v);
        }
        if let Some(v) = delta.generation_error {
            self.generation_error = Some(v);
        }
    }

    /// Merge the user's decision before routing.
    pub fn record_decision(&mut self, signal: ResumeSignal) {
        match &signal {
            ResumeSignal::Change { category } => {
                self.selected_category = Some(category.clone());
            }
            ResumeSignal::Approve {
                edited_draft: Some(text),
            } => {
                self.draft = Some(text.clone());
            }
            ResumeSignal::Approve { edited_draft: None } | ResumeSignal::Reject => {}
        }
        self.decision = Some(signal);
    }

    /// The category to act on: the user's selection, else the proposal.
    pub fn effective_category(&self) -> Option<&str> {
        self.selected_category
            .as_deref()
            .or(self.proposed_category.as_deref())
    }

    pub fn to_json(&self) -> Result<String, DatabaseError> {
        serde_json::to_string(self)
            .map_err(|e| DatabaseError::Serialization(format!("snapshot encode: {e}")))
    }

    /// Decode a stored snapshot, rejecting versions this build does not know.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| DatabaseError::Serialization(format!("snapshot decode: {e}")))?;
        let found = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if u32::try_from(found) != Ok(SNAPSHOT_VERSION) {
            return Err(WorkflowError::UnsupportedSnapshot {
                found,
                supported: SNAPSHOT_VERSION,
            }
            .into());
        }
        let snapshot = serde_json::from_value(value)
            .map_err(|e| DatabaseError::Serialization(format!("snapshot decode: {e}")))?;
        Ok(snapshot)
    }
}

/// A node's output. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDelta {
    pub channel_id: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub thread_ref: Option<String>,
    pub category_options: Option<Vec<String>>,
    pub classification: Option<Classification>,
    pub priority: Option<PriorityResult>,
    pub proposed_category: Option<String>,
    pub draft: Option<String>,
    pub context: Option<ContextSummary>,
    pub notification_handles: Option<Vec<String>>,
    pub notified: Option<bool>,
    pub response_sent: Option<bool>,
    pub action_executed: Option<bool>,
    pub confirmed: Option<bool>,
    pub classification_error: Option<String>,
    pub generation_error: Option<String>,
}
