//! Thin HTTP CRUD facade over `Engine` (spec §6).
//!
//! Deliberately minimal: no auth, no pagination, no validation beyond
//! what axum's extractors give for free. Correctness and design effort
//! went into the engine and the push-stream protocol, not here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use taskforge_core::store::DurableStore;
use taskforge_core::{EngineError, Task};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/stop", post(stop_task))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    input_prompt: String,
    #[serde(default)]
    title: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .engine
        .create_task(req.input_prompt, req.title)
        .await?;
    Ok(Json(task))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.engine.list_tasks().await?))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.get_task(&id).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.store().delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.start_task(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.stop_task(&id)?;
    Ok(StatusCode::ACCEPTED)
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyRunning(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
