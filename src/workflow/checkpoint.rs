//! Durable, append-only checkpoint log.
//!
//! The latest row per thread is authoritative. Writes are a single atomic
//! statement in the store and are never retried here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{DatabaseError, Error};
use crate::store::{CheckpointRecord, Database};
use crate::workflow::state::{NodeName, SNAPSHOT_VERSION, Snapshot};

/// A decoded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub sequence: i64,
    /// Last node that completed (or the suspend point).
    pub node: NodeName,
    pub snapshot: Snapshot,
    pub written_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    db: Arc<dyn Database>,
}

impl CheckpointStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append a checkpoint and return its sequence number.
    pub async fn write(
        &self,
        thread_id: &str,
        node: NodeName,
        snapshot: &Snapshot,
    ) -> Result<i64, DatabaseError> {
        let state = snapshot.to_json()?;
        let sequence = self
            .db
            .append_checkpoint(thread_id, node.as_str(), SNAPSHOT_VERSION, &state)
            .await?;
        debug!(thread_id, node = %node, sequence, "Checkpoint written");
        Ok(sequence)
    }

    /// The latest checkpoint, if the thread has any.
    pub async fn read_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, Error> {
        match self.db.latest_checkpoint(thread_id).await? {
            Some(record) => Ok(Some(decode(record)?)),
            None => Ok(None),
        }
    }

    /// Every checkpoint of a thread, oldest first.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, Error> {
        self.db
            .list_checkpoints(thread_id)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }
}

fn decode(record: CheckpointRecord) -> Result<Checkpoint, Error> {
    let node: NodeName = record.node_name.parse()?;
    let snapshot = Snapshot::from_json(&record.state)?;
    Ok(Checkpoint {
        sequence: record.sequence,
        node,
        snapshot,
        written_at: record.written_at,
    })
}
