//! Task management endpoints.
//!
//! Creation resolves each wire-level step spec against the server's
//! [`WorkLibrary`](crate::work::WorkLibrary) before handing the task to the
//! engine; everything else is a thin projection over the engine's registry.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;
use uuid::Uuid;

use marathon_core::TaskState;

use crate::error::ServerError;
use crate::schemas::task::{
    CheckpointResponse, CreateTaskRequest, CreateTaskResponse, StepResponse, StepSpec,
    TaskResponse, TaskStatusQuery, TaskSummary,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        create_task,
        list_tasks,
        get_task,
        cancel_task,
        recover_task,
        delete_task
    ),
    components(schemas(
        CreateTaskRequest,
        CreateTaskResponse,
        StepSpec,
        TaskResponse,
        TaskSummary,
        StepResponse,
        CheckpointResponse
    ))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/recover", post(recover_task))
}

#[utoipa::path(
    post,
    path = "/v1/tasks",
    tag = "tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 200, description = "Task created", body = CreateTaskResponse),
        (status = 400, description = "Invalid definition or unknown step kind"),
        (status = 503, description = "Engine queue full"),
    )
)]
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ServerError> {
    let mut definitions = Vec::with_capacity(req.steps.len());
    for spec in &req.steps {
        definitions.push(state.work.resolve(spec)?);
    }

    let task_id = state.engine.create(definitions).await?;
    info!(task_id = %task_id, steps = req.steps.len(), "task created");
    Ok(Json(CreateTaskResponse {
        task_id: task_id.to_string(),
        status: TaskState::Pending.to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(TaskStatusQuery),
    responses(
        (status = 200, description = "Tasks listed", body = [TaskSummary]),
        (status = 400, description = "Unknown status filter"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskStatusQuery>,
) -> Result<Json<Vec<TaskSummary>>, ServerError> {
    let filter = match q.status.as_deref() {
        None => None,
        Some(s) => Some(s.parse::<TaskState>().map_err(|_| {
            ServerError::BadRequest(format!("unknown status filter: {s}"))
        })?),
    };
    let tasks = state.engine.registry().list(filter).await;
    Ok(Json(tasks.iter().map(TaskSummary::from_task).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "ID of the task to retrieve")),
    responses(
        (status = 200, description = "Task retrieved", body = TaskResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ServerError> {
    let view = state
        .engine
        .registry()
        .view(id)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(TaskResponse::from_view(&view)))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/cancel",
    tag = "tasks",
    params(("id" = String, Path, description = "ID of the task to cancel")),
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 400, description = "Task is not cancellable"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let task = state
        .engine
        .registry()
        .get(id)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;

    if task.status.is_terminal() {
        return Err(ServerError::BadRequest(format!(
            "task {id} is not cancellable (status: {})",
            task.status
        )));
    }

    // Cooperative: the flag is observed at the next step boundary; the
    // in-flight step finishes and its outcome is still recorded.
    state.engine.cancel(id);

    info!(task_id = %id, "task cancelled");
    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/recover",
    tag = "tasks",
    params(("id" = String, Path, description = "ID of the task to recover")),
    responses(
        (status = 200, description = "Recovery started", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is not recoverable"),
    )
)]
pub async fn recover_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ServerError> {
    state.engine.recover(id).await?;
    info!(task_id = %id, "task recovery accepted");

    let view = state
        .engine
        .registry()
        .view(id)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(TaskResponse::from_view(&view)))
}

#[utoipa::path(
    delete,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "ID of the task to remove")),
    responses(
        (status = 200, description = "Task removed"),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is still active"),
    )
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.engine.registry().remove(id).await?;
    info!(task_id = %id, "task removed");
    Ok(Json(serde_json::json!({ "status": "removed" })))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use marathon_core::{EngineConfig, EngineError, PipelineEngine};
    use serde_json::json;

    use crate::config::Config;
    use crate::work::WorkLibrary;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            config: Arc::new(Config::from_env()),
            engine: PipelineEngine::start(EngineConfig::default()),
            work: Arc::new(WorkLibrary::with_builtins()),
        })
    }

    fn sleep_spec(duration_ms: u64) -> StepSpec {
        StepSpec {
            kind: "sleep".to_owned(),
            name: None,
            description: None,
            max_retries: None,
            weight: None,
            params: Some(json!({ "duration_ms": duration_ms })),
        }
    }

    async fn wait_status(state: &Arc<AppState>, id: Uuid, status: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = state.engine.registry().get(id).await.expect("task exists");
                if task.status == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should reach the expected status within timeout");
    }

    #[tokio::test]
    async fn create_then_get_reports_full_projection() {
        let state = test_state();
        let Json(created) = create_task(
            State(state.clone()),
            Json(CreateTaskRequest {
                steps: vec![
                    sleep_spec(5),
                    StepSpec {
                        kind: "digest".to_owned(),
                        name: None,
                        description: None,
                        max_retries: None,
                        weight: None,
                        params: None,
                    },
                ],
            }),
        )
        .await
        .expect("create should succeed");
        let id: Uuid = created.task_id.parse().expect("uuid");

        wait_status(&state, id, TaskState::Completed).await;

        let Json(task) = get_task(State(state.clone()), Path(id))
            .await
            .expect("get should succeed");
        assert_eq!(task.status, "completed");
        assert_eq!(task.total_steps, 2);
        assert_eq!(task.current_step_index, 2);
        assert_eq!(task.progress, 1.0);
        assert_eq!(task.checkpoints.len(), 2);
        assert!(task.checkpoints[1].accumulated_results.get("digest").is_some());
        assert!(!task.can_recover);
    }

    #[tokio::test]
    async fn create_with_unknown_kind_is_rejected() {
        let state = test_state();
        let err = create_task(
            State(state.clone()),
            Json(CreateTaskRequest {
                steps: vec![StepSpec {
                    kind: "no-such-kind".to_owned(),
                    name: None,
                    description: None,
                    max_retries: None,
                    weight: None,
                    params: None,
                }],
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
        assert!(state.engine.registry().list(None).await.is_empty());
    }

    #[tokio::test]
    async fn terminal_task_is_not_cancellable_but_is_removable() {
        let state = test_state();
        let Json(created) = create_task(
            State(state.clone()),
            Json(CreateTaskRequest {
                steps: vec![sleep_spec(1)],
            }),
        )
        .await
        .expect("create should succeed");
        let id: Uuid = created.task_id.parse().expect("uuid");
        wait_status(&state, id, TaskState::Completed).await;

        let err = cancel_task(State(state.clone()), Path(id)).await.unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let err = recover_task(State(state.clone()), Path(id)).await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::Engine(EngineError::NotRecoverable { .. })
        ));

        delete_task(State(state.clone()), Path(id))
            .await
            .expect("terminal task should be removable");
        assert!(state.engine.registry().get(id).await.is_none());
    }

    #[tokio::test]
    async fn list_rejects_unknown_status_filter() {
        let state = test_state();
        let err = list_tasks(
            State(state),
            Query(TaskStatusQuery {
                status: Some("bogus".to_owned()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }
}
