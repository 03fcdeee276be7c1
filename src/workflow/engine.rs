//! Workflow engine. Drives the triage graph node by node.
//!
//! A checkpoint is written after every completed node. Reaching
//! `await_approval` without a decision suspends the instance; nothing is held
//! in memory while it waits. Resume reloads the latest checkpoint, merges the
//! user's decision and continues to the next suspend or terminal boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::MessageHandle;
use crate::error::{NodeError, Result, WorkflowError};
use crate::store::libsql_backend::item_status_to_str;
use crate::store::{ApprovalMapping, ItemStatus, WorkflowInstance, WorkflowStatus};
use crate::workflow::approval::{ApprovalKey, CallbackKind};
use crate::workflow::checkpoint::CheckpointStore;
use crate::workflow::nodes::{self, NodeContext};
use crate::workflow::router::next_node;
use crate::workflow::state::{NodeName, ResumeSignal, Snapshot};

// ── Thread locks ────────────────────────────────────────────────────

/// Per-thread mutual exclusion. Entries are removed once nobody holds or
/// waits for them.
#[derive(Default)]
pub struct ThreadLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadLocks {
    pub async fn acquire(&self, thread_id: &str) -> ThreadGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(thread_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        ThreadGuard {
            locks: self,
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Threads currently locked or waited on.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct ThreadGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let idle = map
            .get(&self.thread_id)
            .is_some_and(|m| Arc::strong_count(m) == 1);
        if idle {
            map.remove(&self.thread_id);
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// A button press relayed from the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// The message the button was attached to, when the channel reports it.
    pub message_handle: Option<MessageHandle>,
    pub data: String,
}

/// Result of delivering a decision to a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The workflow ran to its next boundary.
    Advanced(WorkflowStatus),
    /// The decision was already applied; nothing happened.
    AlreadyAdvanced,
    /// An edit ticket is open; the next text message becomes the draft.
    AwaitingEdit,
    NotFound,
}

pub struct WorkflowEngine {
    ctx: NodeContext,
    checkpoints: CheckpointStore,
    locks: ThreadLocks,
}

impl WorkflowEngine {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            checkpoints: CheckpointStore::new(Arc::clone(&ctx.db)),
            ctx,
            locks: ThreadLocks::default(),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Start a workflow for a stored item and run it to its first boundary.
    pub async fn start(&self, item_id: &str) -> Result<String> {
        let item = self
            .ctx
            .db
            .get_item(item_id)
            .await?
            .ok_or_else(|| WorkflowError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;

        let thread_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.ctx
            .db
            .create_instance(&WorkflowInstance {
                thread_id: thread_id.clone(),
                item_id: item.id.clone(),
                user_id: item.user_id.clone(),
                current_node: NodeName::ExtractContext.as_str().to_string(),
                status: WorkflowStatus::Running,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.ctx.db.set_item_thread(&item.id, &thread_id).await?;
        self.ctx
            .db
            .update_item_status(&item.id, ItemStatus::Processing, None)
            .await?;
        info!(thread_id = %thread_id, item_id = %item.id, "Workflow started");

        let _guard = self.locks.acquire(&thread_id).await;
        let snapshot = Snapshot::new(&thread_id, &item.id, &item.user_id, &item.channel_id);
        let status = self.drive(snapshot, NodeName::ExtractContext).await?;
        debug!(thread_id = %thread_id, ?status, "Workflow reached boundary");
        Ok(thread_id)
    }

    /// Deliver the user's decision to a suspended workflow.
    ///
    /// A workflow whose latest checkpoint is not the suspend point has already
    /// moved on; the call is then a no-op.
    pub async fn resume(&self, thread_id: &str, signal: ResumeSignal) -> Result<ResumeOutcome> {
        let _guard = self.locks.acquire(thread_id).await;

        let Some(latest) = self.checkpoints.read_latest(thread_id).await? else {
            warn!(thread_id, "Resume for unknown workflow");
            return Ok(ResumeOutcome::NotFound);
        };
        if latest.node != NodeName::AwaitApproval {
            info!(thread_id, node = %latest.node, "Workflow already advanced, ignoring resume");
            return Ok(ResumeOutcome::AlreadyAdvanced);
        }

        let mut snapshot = latest.snapshot;
        info!(
            thread_id,
            item_id = %snapshot.item_id,
            action = signal.label(),
            "Resuming workflow"
        );
        snapshot.record_decision(signal);

        self.ctx
            .db
            .update_instance(
                thread_id,
                NodeName::AwaitApproval.as_str(),
                WorkflowStatus::Running,
                None,
            )
            .await?;
        self.ctx
            .db
            .update_item_status(&snapshot.item_id, ItemStatus::Processing, None)
            .await?;

        let status = self.drive(snapshot, NodeName::AwaitApproval).await?;
        Ok(ResumeOutcome::Advanced(status))
    }

    /// Resolve a button press to its workflow and apply it.
    pub async fn resume_from_callback(&self, payload: &CallbackPayload) -> Result<ResumeOutcome> {
        let action = self.ctx.approvals.parse_callback(&payload.data)?;

        let mut mapping = match &payload.message_handle {
            Some(handle) => {
                self.ctx
                    .approvals
                    .resolve(&ApprovalKey::Handle(handle.clone()))
                    .await?
            }
            None => None,
        };
        if mapping.is_none() {
            mapping = self
                .ctx
                .approvals
                .resolve(&ApprovalKey::Item(action.item_id.clone()))
                .await?;
        }
        let Some(mapping) = mapping.filter(|m| m.item_id == action.item_id) else {
            warn!(item_id = %action.item_id, "Callback for unknown approval");
            return Ok(ResumeOutcome::NotFound);
        };

        let signal = match action.kind {
            CallbackKind::Approve => ResumeSignal::Approve { edited_draft: None },
            CallbackKind::Reject => ResumeSignal::Reject,
            CallbackKind::Change(index) => {
                let Some(latest) = self.checkpoints.read_latest(&mapping.thread_id).await? else {
                    return Ok(ResumeOutcome::NotFound);
                };
                if latest.node != NodeName::AwaitApproval {
                    return Ok(ResumeOutcome::AlreadyAdvanced);
                }
                let category = latest
                    .snapshot
                    .category_options
                    .get(index)
                    .cloned()
                    .ok_or_else(|| WorkflowError::UnknownCallback(payload.data.clone()))?;
                ResumeSignal::Change { category }
            }
            CallbackKind::Edit => return self.open_edit(&mapping).await,
        };

        self.resume(&mapping.thread_id, signal).await
    }

    /// Apply a text reply as the edited draft, if an edit ticket is open.
    pub async fn submit_edit(&self, channel_id: &str, text: &str) -> Result<ResumeOutcome> {
        let Some(edit) = self.ctx.approvals.take_edit(channel_id).await? else {
            debug!(channel_id, "No open edit ticket");
            return Ok(ResumeOutcome::NotFound);
        };
        self.resume(
            &edit.thread_id,
            ResumeSignal::Approve {
                edited_draft: Some(text.trim().to_string()),
            },
        )
        .await
    }

    /// Start a fresh workflow for an item whose last run failed.
    pub async fn manual_retry(&self, item_id: &str) -> Result<String> {
        let item = self
            .ctx
            .db
            .get_item(item_id)
            .await?
            .ok_or_else(|| WorkflowError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;

        let last_run_failed = match &item.thread_id {
            Some(thread_id) => self
                .ctx
                .db
                .get_instance(thread_id)
                .await?
                .is_some_and(|i| i.status == WorkflowStatus::Failed),
            None => false,
        };
        if item.status != ItemStatus::Error && !last_run_failed {
            return Err(WorkflowError::InvalidTransition {
                item_id: item_id.to_string(),
                status: item_status_to_str(item.status).to_string(),
                action: "retry".into(),
            }
            .into());
        }

        info!(item_id, previous_thread = ?item.thread_id, "Manual retry");
        self.ctx
            .db
            .update_item_status(item_id, ItemStatus::Pending, None)
            .await?;
        self.start(item_id).await
    }

    /// Continue every instance left running by a previous process.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let running = self
            .ctx
            .db
            .list_instances_by_status(WorkflowStatus::Running)
            .await?;
        if running.is_empty() {
            return Ok(0);
        }
        info!(count = running.len(), "Recovering interrupted workflows");

        let results = join_all(running.iter().map(|i| self.recover_one(i))).await;
        let mut recovered = 0;
        for (instance, result) in running.iter().zip(results) {
            match result {
                Ok(status) => {
                    info!(thread_id = %instance.thread_id, ?status, "Workflow recovered");
                    recovered += 1;
                }
                Err(e) => {
                    error!(thread_id = %instance.thread_id, error = %e, "Workflow recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn recover_one(&self, instance: &WorkflowInstance) -> Result<WorkflowStatus> {
        let _guard = self.locks.acquire(&instance.thread_id).await;
        let thread_id = instance.thread_id.as_str();

        let Some(latest) = self.checkpoints.read_latest(thread_id).await? else {
            let item = self
                .ctx
                .db
                .get_item(&instance.item_id)
                .await?
                .ok_or_else(|| WorkflowError::ItemNotFound {
                    item_id: instance.item_id.clone(),
                })?;
            let snapshot = Snapshot::new(thread_id, &item.id, &item.user_id, &item.channel_id);
            return self.drive(snapshot, NodeName::ExtractContext).await;
        };

        match latest.node {
            // The decision is not checkpointed until the next node completes,
            // so the user has to answer again.
            NodeName::AwaitApproval => {
                self.suspend(&latest.snapshot).await?;
                Ok(WorkflowStatus::Suspended)
            }
            NodeName::End => {
                self.ctx
                    .db
                    .update_instance(thread_id, NodeName::End.as_str(), WorkflowStatus::Completed, None)
                    .await?;
                Ok(WorkflowStatus::Completed)
            }
            NodeName::Failed => {
                self.ctx
                    .db
                    .update_instance(
                        thread_id,
                        NodeName::Failed.as_str(),
                        WorkflowStatus::Failed,
                        latest.snapshot.error.as_deref(),
                    )
                    .await?;
                Ok(WorkflowStatus::Failed)
            }
            completed => {
                let next = next_node(completed, &latest.snapshot);
                debug!(thread_id, after = %completed, next = %next, "Continuing from checkpoint");
                self.drive(latest.snapshot, next).await
            }
        }
    }

    /// Run nodes from `node` until the workflow suspends, ends or fails.
    /// The caller holds the thread lock.
    async fn drive(&self, mut snapshot: Snapshot, mut node: NodeName) -> Result<WorkflowStatus> {
        let thread_id = snapshot.thread_id.clone();
        loop {
            match node {
                NodeName::End => {
                    self.checkpoint(&snapshot, NodeName::End).await?;
                    self.ctx
                        .db
                        .update_instance(&thread_id, node.as_str(), WorkflowStatus::Completed, None)
                        .await?;
                    info!(thread_id = %thread_id, item_id = %snapshot.item_id, "Workflow completed");
                    return Ok(WorkflowStatus::Completed);
                }
                NodeName::AwaitApproval if snapshot.decision.is_none() => {
                    self.checkpoint(&snapshot, NodeName::AwaitApproval).await?;
                    self.suspend(&snapshot).await?;
                    info!(thread_id = %thread_id, item_id = %snapshot.item_id, "Workflow suspended");
                    return Ok(WorkflowStatus::Suspended);
                }
                NodeName::AwaitApproval => {
                    node = next_node(node, &snapshot);
                }
                NodeName::Failed => return Ok(WorkflowStatus::Failed),
                current => {
                    debug!(thread_id = %thread_id, node = %current, "Entering node");
                    self.ctx
                        .db
                        .update_instance(&thread_id, current.as_str(), WorkflowStatus::Running, None)
                        .await?;

                    match nodes::run(current, &snapshot, &self.ctx).await {
                        Ok(delta) => {
                            snapshot.apply(delta);
                            self.checkpoint(&snapshot, current).await?;
                            node = next_node(current, &snapshot);
                        }
                        Err(e) => return self.abort(snapshot, current, e).await,
                    }
                }
            }
        }
    }

    async fn suspend(&self, snapshot: &Snapshot) -> Result<()> {
        self.ctx
            .db
            .update_instance(
                &snapshot.thread_id,
                NodeName::AwaitApproval.as_str(),
                WorkflowStatus::Suspended,
                None,
            )
            .await?;
        self.ctx
            .db
            .update_item_status(&snapshot.item_id, ItemStatus::AwaitingApproval, None)
            .await?;
        Ok(())
    }

    /// Write a checkpoint. A failed write fails the instance and is not retried.
    async fn checkpoint(&self, snapshot: &Snapshot, node: NodeName) -> Result<i64> {
        match self
            .checkpoints
            .write(&snapshot.thread_id, node, snapshot)
            .await
        {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                error!(
                    thread_id = %snapshot.thread_id,
                    node = %node,
                    error = %e,
                    "Checkpoint write failed"
                );
                let reason = format!("checkpoint write failed at {node}: {e}");
                if let Err(e) = self
                    .ctx
                    .db
                    .update_instance(
                        &snapshot.thread_id,
                        node.as_str(),
                        WorkflowStatus::Failed,
                        Some(&reason),
                    )
                    .await
                {
                    warn!(thread_id = %snapshot.thread_id, error = %e, "Could not mark instance failed");
                }
                if let Err(e) = self
                    .ctx
                    .db
                    .update_item_status(&snapshot.item_id, ItemStatus::Error, Some(&reason))
                    .await
                {
                    warn!(item_id = %snapshot.item_id, error = %e, "Could not mark item failed");
                }
                Err(WorkflowError::CheckpointWrite {
                    thread_id: snapshot.thread_id.clone(),
                    node: node.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Abort after a node failure. The terminal snapshot always carries a
    /// classification.
    async fn abort(
        &self,
        mut snapshot: Snapshot,
        node: NodeName,
        err: NodeError,
    ) -> Result<WorkflowStatus> {
        let reason = format!("{node}: {err}");
        error!(
            thread_id = %snapshot.thread_id,
            item_id = %snapshot.item_id,
            node = %node,
            error = %err,
            "Node failed, aborting workflow"
        );

        if snapshot.classification.is_none() {
            let fallback = self.ctx.fallback_classification(&snapshot, &reason);
            snapshot.proposed_category = Some(fallback.category.clone());
            snapshot.classification = Some(fallback);
        }
        snapshot.error = Some(reason.clone());

        self.checkpoint(&snapshot, NodeName::Failed).await?;
        self.ctx
            .db
            .update_instance(
                &snapshot.thread_id,
                NodeName::Failed.as_str(),
                WorkflowStatus::Failed,
                Some(&reason),
            )
            .await?;
        self.ctx
            .db
            .update_item_status(&snapshot.item_id, ItemStatus::Error, Some(&reason))
            .await?;
        Ok(WorkflowStatus::Failed)
    }

    /// Handle the edit button: open a ticket and prompt for the text.
    async fn open_edit(&self, mapping: &ApprovalMapping) -> Result<ResumeOutcome> {
        let Some(latest) = self.checkpoints.read_latest(&mapping.thread_id).await? else {
            return Ok(ResumeOutcome::NotFound);
        };
        if latest.node != NodeName::AwaitApproval {
            return Ok(ResumeOutcome::AlreadyAdvanced);
        }

        let channel_id = latest.snapshot.channel_id.as_str();
        self.ctx.approvals.open_edit(mapping, channel_id).await?;
        if let Err(e) = self
            .ctx
            .notifier
            .send(
                channel_id,
                &format!(
                    "✏️ Send the new reply for \"{}\" as your next message.",
                    latest.snapshot.subject
                ),
                &[],
            )
            .await
        {
            warn!(thread_id = %mapping.thread_id, error = %e, "Could not send edit prompt");
        }
        Ok(ResumeOutcome::AwaitingEdit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn thread_lock_serializes_and_cleans_up() {
        let locks = Arc::new(ThreadLocks::default());
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _g = locks.acquire("t1").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_threads_do_not_block() {
        let locks = ThreadLocks::default();
        let _a = locks.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .expect("independent thread lock");
        assert_eq!(locks.active(), 2);
    }
}
