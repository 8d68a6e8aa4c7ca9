use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::checkpoint::CheckpointStore;
use crate::runtime::step::StepDefinition;
use crate::runtime::types::{EngineError, Step, StepState, Task, TaskId, TaskState, TaskView};

/// Incremental status delta emitted on every committed transition.
///
/// Observers subscribe via [`TaskRegistry::subscribe`]; a lagging or freshly
/// connected observer re-syncs by fetching the full [`TaskView`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        status: TaskState,
    },
    StepStarted {
        task_id: TaskId,
        step_index: usize,
        step_name: String,
    },
    StepCompleted {
        task_id: TaskId,
        step_index: usize,
        step_name: String,
        duration_ms: u64,
        progress: f64,
    },
    StepFailed {
        task_id: TaskId,
        step_index: usize,
        step_name: String,
        error: String,
    },
    CheckpointRecorded {
        task_id: TaskId,
        step_index: usize,
        checkpoint_id: Uuid,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::StatusChanged { task_id, .. }
            | TaskEvent::StepStarted { task_id, .. }
            | TaskEvent::StepCompleted { task_id, .. }
            | TaskEvent::StepFailed { task_id, .. }
            | TaskEvent::CheckpointRecorded { task_id, .. } => *task_id,
        }
    }
}

/// Everything a recovered task needs to re-enter the execution loop.
#[derive(Debug)]
pub(crate) struct RecoveryPlan {
    pub resume_index: usize,
    pub state_snapshot: Value,
    pub accumulated_results: Map<String, Value>,
    pub definitions: Vec<StepDefinition>,
}

/// The complete in-memory record for a single task.
#[derive(Debug)]
struct TaskEntry {
    task: Task,
    /// Kept for recovery; the engine consumes a clone per run.
    definitions: Vec<StepDefinition>,
    /// Cancellation sender; replaced with a fresh channel on recovery.
    cancel_tx: Arc<watch::Sender<bool>>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Single source of truth for all live and historical tasks.
///
/// Uses a `tokio::sync::RwLock<HashMap>` so many observers can read
/// concurrently while each task's single engine driver commits transitions.
/// Every status mutation funnels through the commit methods below; nothing
/// else touches a task's state.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<TaskId, TaskEntry>>>,
    checkpoints: CheckpointStore,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub(crate) fn new(checkpoints: CheckpointStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            checkpoints,
            events,
        }
    }

    /// Subscribe to the status-delta stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        // Fails only when nobody is subscribed, which is the normal idle case.
        let _ = self.events.send(event);
    }

    /// Insert a new `Pending` task built from validated definitions.
    pub(crate) async fn insert(&self, definitions: Vec<StepDefinition>) -> TaskId {
        let now = Utc::now();
        let steps = definitions
            .iter()
            .map(|def| Step {
                id: Uuid::new_v4(),
                name: def.name.clone(),
                description: def.description.clone(),
                status: StepState::Pending,
                retry_count: 0,
                max_retries: def.max_retries,
                weight: def.weight,
                started_at: None,
                completed_at: None,
                duration_ms: None,
                error_message: None,
            })
            .collect();

        let task = Task {
            id: Uuid::new_v4(),
            status: TaskState::Pending,
            steps,
            current_step_index: 0,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_completion: None,
            error: None,
            can_recover: false,
        };
        let task_id = task.id;

        let (cancel_tx, _) = watch::channel(false);
        let entry = TaskEntry {
            task,
            definitions,
            cancel_tx: Arc::new(cancel_tx),
        };
        self.inner.write().await.insert(task_id, entry);
        task_id
    }

    // ── Observer queries ─────────────────────────────────────────────────────

    /// Snapshot of a task's observable record.
    pub async fn get(&self, task_id: TaskId) -> Option<Task> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|entry| entry.task.clone())
    }

    /// Snapshot of a task together with its checkpoints.
    pub async fn view(&self, task_id: TaskId) -> Option<TaskView> {
        let task = self.get(task_id).await?;
        let checkpoints = self.checkpoints.list(task_id).await;
        Some(TaskView { task, checkpoints })
    }

    /// All tasks, newest first, optionally filtered by status. Read-only.
    pub async fn list(&self, status: Option<TaskState>) -> Vec<Task> {
        let guard = self.inner.read().await;
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|entry| status.is_none_or(|s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect();
        drop(guard);
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    // ── Retention ────────────────────────────────────────────────────────────

    /// Remove a terminal task and its checkpoints.
    pub async fn remove(&self, task_id: TaskId) -> Result<(), EngineError> {
        {
            let mut guard = self.inner.write().await;
            let entry = guard
                .get(&task_id)
                .ok_or(EngineError::NotFound { task_id })?;
            if !entry.task.status.is_terminal() {
                return Err(EngineError::TaskStillActive {
                    task_id,
                    status: entry.task.status,
                });
            }
            guard.remove(&task_id);
        }
        self.checkpoints.remove_task(task_id).await;
        Ok(())
    }

    /// Remove every terminal task whose `completed_at` fell outside the
    /// retention window. Returns the number of tasks removed.
    pub async fn gc_expired(&self, retention: Duration) -> usize {
        let retention = match chrono::Duration::from_std(retention) {
            Ok(d) => d,
            // A window too large for chrono means nothing can be expired.
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - retention;

        let expired: Vec<TaskId> = self
            .inner
            .read()
            .await
            .values()
            .filter(|entry| {
                entry.task.status.is_terminal()
                    && entry.task.completed_at.is_some_and(|t| t <= cutoff)
            })
            .map(|entry| entry.task.id)
            .collect();

        let mut removed = 0;
        for task_id in expired {
            // Re-check under the write lock: a failed task may have entered
            // recovery between the scan and this removal.
            let still_terminal = {
                let mut guard = self.inner.write().await;
                let terminal = guard
                    .get(&task_id)
                    .is_some_and(|entry| entry.task.status.is_terminal());
                if terminal {
                    guard.remove(&task_id);
                }
                terminal
            };
            if still_terminal {
                self.checkpoints.remove_task(task_id).await;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "terminal tasks garbage-collected");
        }
        removed
    }

    // ── Cancellation plumbing ────────────────────────────────────────────────

    pub(crate) async fn cancel_sender(
        &self,
        task_id: TaskId,
    ) -> Option<Arc<watch::Sender<bool>>> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|entry| Arc::clone(&entry.cancel_tx))
    }

    pub(crate) async fn cancel_receiver(
        &self,
        task_id: TaskId,
    ) -> Option<watch::Receiver<bool>> {
        self.inner
            .read()
            .await
            .get(&task_id)
            .map(|entry| entry.cancel_tx.subscribe())
    }

    // ── Transition commits (engine-only) ─────────────────────────────────────

    pub(crate) async fn mark_running(&self, task_id: TaskId) {
        let mut changed = false;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            entry.task.status = TaskState::Running;
            if entry.task.started_at.is_none() {
                entry.task.started_at = Some(Utc::now());
            }
            changed = true;
        }
        if changed {
            self.emit(TaskEvent::StatusChanged {
                task_id,
                status: TaskState::Running,
            });
        }
    }

    pub(crate) async fn set_step_running(&self, task_id: TaskId, step_index: usize) {
        let mut step_name = None;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            entry.task.current_step_index = step_index;
            if let Some(step) = entry.task.steps.get_mut(step_index) {
                step.status = StepState::Running;
                step.started_at = Some(Utc::now());
                step.completed_at = None;
                step.duration_ms = None;
                step.error_message = None;
                step_name = Some(step.name.clone());
            }
        }
        if let Some(step_name) = step_name {
            self.emit(TaskEvent::StepStarted {
                task_id,
                step_index,
                step_name,
            });
        }
    }

    /// Commit a completed step: step record, checkpoint reference, progress,
    /// projection, and the index advance happen under one write lock so
    /// observers never see them out of sync. Completing the final step also
    /// finalizes the task in the same commit, so no observer can catch a
    /// `Running` task whose index has already reached the step count.
    ///
    /// Returns `true` when this step was the last one and the task is done.
    pub(crate) async fn complete_step(
        &self,
        task_id: TaskId,
        step_index: usize,
        duration_ms: u64,
        failed_attempts: u32,
        checkpoint_id: Uuid,
    ) -> bool {
        let mut committed = None;
        let mut task_done = false;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            let now = Utc::now();
            if let Some(step) = entry.task.steps.get_mut(step_index) {
                step.status = StepState::Completed;
                step.completed_at = Some(now);
                step.duration_ms = Some(duration_ms);
                step.retry_count = step.retry_count.max(failed_attempts);
                step.error_message = None;
            }
            entry.task.current_step_index = step_index + 1;
            entry.task.progress = compute_progress(&entry.task.steps);
            entry.task.estimated_completion = project_completion(&entry.task.steps, now);
            task_done = entry.task.current_step_index == entry.task.steps.len();
            if task_done {
                entry.task.status = TaskState::Completed;
                entry.task.completed_at = Some(now);
                entry.task.estimated_completion = None;
            }
            if let Some(step) = entry.task.steps.get(step_index) {
                committed = Some((step.name.clone(), entry.task.progress));
            }
        }
        if let Some((step_name, progress)) = committed {
            self.emit(TaskEvent::CheckpointRecorded {
                task_id,
                step_index,
                checkpoint_id,
            });
            self.emit(TaskEvent::StepCompleted {
                task_id,
                step_index,
                step_name,
                duration_ms,
                progress,
            });
            if task_done {
                self.emit(TaskEvent::StatusChanged {
                    task_id,
                    status: TaskState::Completed,
                });
            }
        }
        task_done
    }

    pub(crate) async fn fail_task(
        &self,
        task_id: TaskId,
        step_index: usize,
        failed_attempts: u32,
        duration_ms: u64,
        message: String,
        can_recover: bool,
    ) {
        let mut step_name = None;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            let now = Utc::now();
            if let Some(step) = entry.task.steps.get_mut(step_index) {
                step.status = StepState::Failed;
                step.completed_at = Some(now);
                step.duration_ms = Some(duration_ms);
                step.retry_count = step.retry_count.max(failed_attempts);
                step.error_message = Some(message.clone());
                step_name = Some(step.name.clone());
            }
            entry.task.status = TaskState::Failed;
            entry.task.error = Some(message.clone());
            entry.task.completed_at = Some(now);
            entry.task.estimated_completion = None;
            entry.task.can_recover = can_recover;
        }
        if let Some(step_name) = step_name {
            warn!(
                task_id = %task_id,
                step = %step_name,
                attempts = failed_attempts,
                can_recover,
                "task failed"
            );
            self.emit(TaskEvent::StepFailed {
                task_id,
                step_index,
                step_name,
                error: message,
            });
            self.emit(TaskEvent::StatusChanged {
                task_id,
                status: TaskState::Failed,
            });
        }
    }

    pub(crate) async fn cancel_task(&self, task_id: TaskId) {
        let mut changed = false;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            for step in entry.task.steps.iter_mut() {
                if step.status == StepState::Pending {
                    step.status = StepState::Skipped;
                }
            }
            entry.task.status = TaskState::Cancelled;
            entry.task.completed_at = Some(Utc::now());
            entry.task.estimated_completion = None;
            changed = true;
        }
        if changed {
            info!(task_id = %task_id, "task cancelled");
            self.emit(TaskEvent::StatusChanged {
                task_id,
                status: TaskState::Cancelled,
            });
        }
    }

    /// Validate a recovery request and move the task to `Recovering`.
    ///
    /// Resumes at the step after the latest checkpoint: checkpoints record
    /// completed work, so completed steps are never re-run. The previously
    /// failed step keeps its recorded `retry_count` while getting a fresh
    /// attempt sequence.
    pub(crate) async fn begin_recovery(
        &self,
        task_id: TaskId,
    ) -> Result<RecoveryPlan, EngineError> {
        {
            let guard = self.inner.read().await;
            let entry = guard
                .get(&task_id)
                .ok_or(EngineError::NotFound { task_id })?;
            if entry.task.status != TaskState::Failed {
                return Err(EngineError::NotRecoverable {
                    reason: format!("status is {}", entry.task.status),
                });
            }
            if !entry.task.can_recover {
                return Err(EngineError::NotRecoverable {
                    reason: "no checkpoint to resume from".to_owned(),
                });
            }
        }

        // Failed tasks have no running driver, so the record cannot change
        // between the validation above and the commit below.
        let checkpoint = self.checkpoints.latest(task_id).await.ok_or_else(|| {
            EngineError::NotRecoverable {
                reason: "no checkpoint to resume from".to_owned(),
            }
        })?;
        let resume_index = checkpoint.step_index + 1;

        let mut plan = None;
        if let Some(entry) = self.inner.write().await.get_mut(&task_id) {
            entry.task.status = TaskState::Recovering;
            entry.task.error = None;
            entry.task.completed_at = None;
            entry.task.estimated_completion = None;
            entry.task.can_recover = false;
            entry.task.current_step_index = resume_index;
            for step in entry.task.steps.iter_mut().skip(resume_index) {
                // retry_count stays: failure history remains visible.
                step.status = StepState::Pending;
                step.started_at = None;
                step.completed_at = None;
                step.duration_ms = None;
                step.error_message = None;
            }
            let (cancel_tx, _) = watch::channel(false);
            entry.cancel_tx = Arc::new(cancel_tx);
            plan = Some(RecoveryPlan {
                resume_index,
                state_snapshot: checkpoint.state_snapshot.clone(),
                accumulated_results: checkpoint.accumulated_results.clone(),
                definitions: entry.definitions.clone(),
            });
        }

        match plan {
            Some(plan) => {
                info!(task_id = %task_id, resume_index = plan.resume_index, "task recovery started");
                self.emit(TaskEvent::StatusChanged {
                    task_id,
                    status: TaskState::Recovering,
                });
                Ok(plan)
            }
            None => Err(EngineError::NotFound { task_id }),
        }
    }
}

// ── Pure telemetry helpers ────────────────────────────────────────────────────

/// Completed weight over total weight. Pure function of step history.
pub(crate) fn compute_progress(steps: &[Step]) -> f64 {
    let total: u64 = steps.iter().map(|s| u64::from(s.weight.max(1))).sum();
    if total == 0 {
        return 0.0;
    }
    let done: u64 = steps
        .iter()
        .filter(|s| s.status == StepState::Completed)
        .map(|s| u64::from(s.weight.max(1)))
        .sum();
    done as f64 / total as f64
}

/// Advisory completion projection: `now + avg completed-step duration *
/// remaining step count`. `None` until at least one step has a recorded
/// duration, and again once nothing remains.
pub(crate) fn project_completion(steps: &[Step], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let durations: Vec<u64> = steps
        .iter()
        .filter(|s| s.status == StepState::Completed)
        .filter_map(|s| s.duration_ms)
        .collect();
    if durations.is_empty() {
        return None;
    }
    let remaining = steps
        .iter()
        .filter(|s| !matches!(s.status, StepState::Completed | StepState::Skipped))
        .count() as u64;
    if remaining == 0 {
        return None;
    }
    let avg_ms = durations.iter().sum::<u64>() / durations.len() as u64;
    Some(now + chrono::Duration::milliseconds((avg_ms * remaining) as i64))
}
