use marathon_core::{Checkpoint, Step, Task, TaskView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

/// Wire-level step definition submitted at task creation.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StepSpec {
    /// Registered work-callback kind that executes this step.
    pub kind: String,
    /// Display name; defaults to the kind.
    pub name: Option<String>,
    pub description: Option<String>,
    /// Maximum attempts for this step (default 1).
    pub max_retries: Option<u32>,
    /// Relative progress weight (default 1).
    pub weight: Option<u32>,
    /// Opaque parameters forwarded to the work callback.
    #[schema(value_type = Object)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTaskResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize, Default, ToSchema, IntoParams)]
pub struct TaskStatusQuery {
    /// Filter by task status (`pending`, `running`, `recovering`,
    /// `completed`, `failed`, `cancelled`).
    pub status: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StepResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckpointResponse {
    pub checkpoint_id: String,
    pub step_index: usize,
    pub timestamp: String,
    /// Step name → result, for partial-result display.
    #[schema(value_type = Object)]
    pub accumulated_results: Value,
}

/// Compact projection used by the list endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskSummary {
    pub id: String,
    pub status: String,
    pub progress: f64,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Full observer projection of one task.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: String,
    pub status: String,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub progress: f64,
    pub current_step_name: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub estimated_completion: Option<String>,
    pub error: Option<String>,
    pub can_recover: bool,
    pub steps: Vec<StepResponse>,
    pub checkpoints: Vec<CheckpointResponse>,
}

fn step_response(step: &Step) -> StepResponse {
    StepResponse {
        id: step.id.to_string(),
        name: step.name.clone(),
        description: step.description.clone(),
        status: step.status.to_string(),
        retry_count: step.retry_count,
        max_retries: step.max_retries,
        started_at: step.started_at.map(|t| t.to_rfc3339()),
        completed_at: step.completed_at.map(|t| t.to_rfc3339()),
        duration_ms: step.duration_ms,
        error_message: step.error_message.clone(),
    }
}

fn checkpoint_response(checkpoint: &Checkpoint) -> CheckpointResponse {
    CheckpointResponse {
        checkpoint_id: checkpoint.checkpoint_id.to_string(),
        step_index: checkpoint.step_index,
        timestamp: checkpoint.timestamp.to_rfc3339(),
        accumulated_results: Value::Object(checkpoint.accumulated_results.clone()),
    }
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            status: task.status.to_string(),
            progress: task.progress,
            current_step_index: task.current_step_index,
            total_steps: task.steps.len(),
            created_at: task.created_at.to_rfc3339(),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

impl TaskResponse {
    pub fn from_view(view: &TaskView) -> Self {
        let task = &view.task;
        Self {
            id: task.id.to_string(),
            status: task.status.to_string(),
            current_step_index: task.current_step_index,
            total_steps: task.steps.len(),
            progress: task.progress,
            current_step_name: task.current_step_name().map(str::to_owned),
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            estimated_completion: task.estimated_completion.map(|t| t.to_rfc3339()),
            error: task.error.clone(),
            can_recover: task.can_recover,
            steps: task.steps.iter().map(step_response).collect(),
            checkpoints: view.checkpoints.iter().map(checkpoint_response).collect(),
        }
    }
}
