use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::checkpoint::Checkpoint;

/// Unique identifier for a submitted task.
pub type TaskId = Uuid;

/// High-level lifecycle state of a task managed by the [`PipelineEngine`].
///
/// [`PipelineEngine`]: crate::runtime::engine::PipelineEngine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    /// Task has been accepted but its driver has not started yet.
    Pending,
    /// Task is actively executing its steps.
    Running,
    /// A recovery request has been accepted; the task is about to re-enter
    /// the execution loop from its resume point.
    Recovering,
    /// All steps completed successfully.
    Completed,
    /// A step exhausted its retries; recoverable if a checkpoint exists.
    Failed,
    /// Task was cancelled at a step boundary before completing.
    Cancelled,
}

impl TaskState {
    /// Returns `true` once the task has reached a terminal state.
    ///
    /// `Failed` counts as terminal: a failed task stays terminal unless an
    /// explicit recovery request moves it back through `Recovering`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Returns `true` while the task may still make progress on its own.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Execution status of a single step within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never reached because the task was cancelled first.
    Skipped,
}

/// One ordered unit of work inside a task, as observers see it.
///
/// The work callback itself lives in the step's definition, not here; this
/// record only carries identity and execution bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: StepState,
    /// Failed attempts recorded for this step, never above `max_retries`.
    pub retry_count: u32,
    /// Maximum number of attempts (not re-tries after the first) per run.
    pub max_retries: u32,
    /// Relative share of this step in the task's progress computation.
    pub weight: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// The observable record for one long-running task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskState,
    pub steps: Vec<Step>,
    /// Index of the step currently executing or about to execute.
    /// Equals `steps.len()` only when the task is `Completed`.
    pub current_step_index: usize,
    /// Completed weight over total weight, in `[0, 1]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set on every terminal transition; cleared again when a failed task
    /// enters recovery.
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory projection from elapsed step history; never used for control.
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Human-readable failure description, present only while `Failed`.
    pub error: Option<String>,
    /// True iff `Failed` and a checkpoint below the failed step exists.
    pub can_recover: bool,
}

impl Task {
    /// Name of the step at `current_step_index`, if the task is not done.
    pub fn current_step_name(&self) -> Option<&str> {
        self.steps
            .get(self.current_step_index)
            .map(|step| step.name.as_str())
    }
}

/// A consistent read-only snapshot of a task together with its checkpoints,
/// returned to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub checkpoints: Vec<Checkpoint>,
}

/// Errors produced by the orchestration runtime.
///
/// Step failures never appear here: they are absorbed into task state
/// (`Task::error`, `Step::error_message`, `Step::retry_count`). Only
/// request-validation failures surface to callers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed task creation request; no task was created.
    #[error("invalid task definition: {0}")]
    InvalidDefinition(String),

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    NotFound { task_id: TaskId },

    /// Recovery requested on a task that has nothing to resume from.
    #[error("task not recoverable: {reason}")]
    NotRecoverable { reason: String },

    /// Removal requested on a task that is not in a terminal state.
    #[error("task still active: {task_id} (status {status})")]
    TaskStillActive { task_id: TaskId, status: TaskState },

    /// The engine's submission queue is at capacity.
    #[error("engine queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The engine's command loop has stopped.
    #[error("engine shut down")]
    EngineShutdown,
}
