//! Per-task SSE status stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(task_events))]
pub struct EventsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/tasks/{id}/events", get(task_events))
}

/// Server-push channel of incremental status deltas for one task.
///
/// Each frame is a JSON-encoded delta: a status change, a step transition,
/// or a recorded checkpoint. There is no gap-filling: a client that
/// reconnects (or lags and gets dropped frames) re-syncs by fetching the
/// full `GET /v1/tasks/{id}` projection.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/events",
    tag = "tasks",
    params(("id" = String, Path, description = "ID of the task to observe")),
    responses(
        (status = 200, description = "SSE stream of task status deltas"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    state
        .engine
        .registry()
        .get(id)
        .await
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;

    let events = BroadcastStream::new(state.engine.registry().subscribe());
    let stream = events.filter_map(move |event| {
        let item = match event {
            Ok(event) if event.task_id() == id => serde_json::to_string(&event)
                .ok()
                .map(|data| Ok::<Event, Infallible>(Event::default().data(data))),
            // Other tasks' events and lag notices are skipped; lagging
            // clients recover by re-fetching the full task.
            _ => None,
        };
        futures::future::ready(item)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
