//! Task API
//!
//! - `GET /`                   liveness message
//! - `GET /health`             health check
//! - `POST /tasks`             create a task and start it in the background
//! - `GET /tasks`              all tasks, newest first
//! - `GET /tasks/:id`          one task with its logs
//! - `POST /tasks/:id/cancel`  stop a queued or running task

use crate::executor::TaskExecutor;
use crate::runner::RunRequest;
use crate::state::StateManager;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crmqa_common::{new_task_id, Error, LogEntry, Task, TaskState};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared handler state
pub struct ApiState {
    pub state: StateManager,
    pub executor: TaskExecutor,
}

/// Task as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskState,
    pub result: Option<String>,
    pub logs: Vec<LogEntry>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            result: task.result,
            logs: task.logs,
        }
    }
}

/// Store and admission errors mapped onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "Task not found".to_string()),
            Error::QueueFull { .. } => (StatusCode::TOO_MANY_REQUESTS, self.0.to_string()),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()),
            _ => {
                error!("Request failed: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

/// Build the API router
pub fn router(api: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/tasks", post(create_task_handler).get(list_tasks_handler))
        .route("/tasks/:id", get(get_task_handler))
        .route("/tasks/:id/cancel", post(cancel_task_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(api)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(listen: &str, api: Arc<ApiState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Task API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "CRM QA task API is running" }))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn create_task_handler(
    State(api): State<Arc<ApiState>>,
    Json(req): Json<RunRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let admission = api.executor.admit()?;

    let task_id = new_task_id();
    info!("Creating task {} (goal: {:?})", task_id, req.goal);
    api.state.db().create_task(&task_id, &req.parameters())?;

    api.executor.spawn(admission, task_id.clone(), req);

    Ok(Json(TaskResponse {
        task_id,
        status: TaskState::Pending,
        result: None,
        logs: Vec::new(),
    }))
}

async fn get_task_handler(
    State(api): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let id = id.trim();
    let task = api
        .state
        .db()
        .get_task(id)?
        .ok_or_else(|| Error::task_not_found(id))?;
    Ok(Json(task.into()))
}

async fn list_tasks_handler(
    State(api): State<Arc<ApiState>>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let tasks = api.state.db().list_tasks()?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

async fn cancel_task_handler(
    State(api): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = id.trim();
    if api.executor.cancel(id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": id, "cancelled": true })),
        )
            .into_response());
    }

    match api.state.db().get_task(id)? {
        Some(task) => {
            warn!("Cancel requested for inactive task {} ({})", id, task.status);
            let detail = if task.status.is_terminal() {
                format!("Task already {}", task.status)
            } else {
                format!("Task is {} but has no active run", task.status)
            };
            Ok((
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "detail": detail })),
            )
                .into_response())
        }
        None => Err(Error::task_not_found(id).into()),
    }
}
