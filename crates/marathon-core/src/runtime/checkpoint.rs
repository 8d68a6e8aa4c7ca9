use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::runtime::types::TaskId;

/// A durable-in-process snapshot taken immediately after a step completes.
///
/// `state_snapshot` is the opaque resume input for the step *after*
/// `step_index`; `accumulated_results` is the observer-visible map of results
/// produced so far (step name → result).
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    /// Index of the last step that had completed when this was taken.
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    pub state_snapshot: Value,
    pub accumulated_results: Map<String, Value>,
}

/// Append-only, per-task ordered collection of checkpoints.
///
/// Uses a `tokio::sync::RwLock<HashMap>` so many observers can read
/// concurrently while each task's single driver writes. Checkpoints are only
/// ever written by the pipeline engine and only dropped when the owning task
/// is removed.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    inner: Arc<RwLock<HashMap<TaskId, Vec<Checkpoint>>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a checkpoint for `(task_id, step_index)`.
    ///
    /// A step re-completing after recovery replaces its earlier checkpoint in
    /// place, so a task never accumulates more checkpoints than it has steps.
    pub async fn append(
        &self,
        task_id: TaskId,
        step_index: usize,
        state_snapshot: Value,
        accumulated_results: Map<String, Value>,
    ) -> Uuid {
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4(),
            step_index,
            timestamp: Utc::now(),
            state_snapshot,
            accumulated_results,
        };
        let checkpoint_id = checkpoint.checkpoint_id;

        let mut guard = self.inner.write().await;
        let list = guard.entry(task_id).or_default();
        match list.binary_search_by_key(&step_index, |c| c.step_index) {
            Ok(pos) => list[pos] = checkpoint,
            Err(pos) => list.insert(pos, checkpoint),
        }
        checkpoint_id
    }

    /// All checkpoints for a task, ordered by step index ascending.
    pub async fn list(&self, task_id: TaskId) -> Vec<Checkpoint> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The checkpoint with the highest step index, if any.
    pub async fn latest(&self, task_id: TaskId) -> Option<Checkpoint> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .and_then(|list| list.last().cloned())
    }

    /// The resume point for a task about to re-execute `step_index`.
    pub async fn latest_before_or_at(
        &self,
        task_id: TaskId,
        step_index: usize,
    ) -> Option<Checkpoint> {
        self.inner.read().await.get(&task_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|c| c.step_index <= step_index)
                .cloned()
        })
    }

    /// Drop all checkpoints for a task (registry garbage collection only).
    pub async fn remove_task(&self, task_id: TaskId) {
        self.inner.write().await.remove(&task_id);
    }
}
