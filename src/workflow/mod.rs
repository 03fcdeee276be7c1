//! Durable triage workflow.
//!
//! ```text
//! extract_context → classify → detect_priority ─┬─ needs reply ─→ generate_response ─┐
//!                                               └─ sort only ─────────────────────────┴→ notify
//! notify → await_approval (suspend)
//!        ─┬─ reject ──────────────────────────────────→ confirm → end
//!         ├─ approve/change + reply → send_response → execute_action → confirm
//!         └─ approve/change, sort only ─────────────→ execute_action → confirm
//! ```

pub mod approval;
pub mod checkpoint;
pub mod engine;
pub mod nodes;
pub mod router;
pub mod state;

pub use approval::{ApprovalGate, ApprovalKey, CallbackAction, CallbackKind};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use engine::{CallbackPayload, ResumeOutcome, ThreadLocks, WorkflowEngine};
pub use nodes::NodeContext;
pub use state::{
    Classification, ClassificationSource, NodeName, ResumeSignal, SNAPSHOT_VERSION, Snapshot,
    SnapshotDelta,
};

pub use crate::store::WorkflowStatus;
