use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use marshal_core::{OrchestratorError, SubmitRequest};
use marshal_types::{ApprovalDecision, Task, TaskContext, TaskOptions};

use crate::AppState;

#[derive(Debug, Deserialize)]
struct SubmitInput {
    instruction: String,
    #[serde(default)]
    context: Option<TaskContext>,
    #[serde(default, rename = "dryRun")]
    dry_run: bool,
    #[serde(default, rename = "autoApprove")]
    auto_approve: bool,
    #[serde(default, rename = "generatePreview")]
    generate_preview: bool,
}

#[derive(Debug, Serialize)]
struct SubmitOutput {
    #[serde(rename = "taskID")]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalInput {
    decision: String,
}

#[derive(Debug, Serialize)]
struct TaskListOutput {
    tasks: Vec<Task>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidTransition { .. } | OrchestratorError::NotTerminal(_) => {
                StatusCode::CONFLICT
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/task", post(submit_task).get(list_tasks))
        .route("/task/{id}", get(get_task).delete(remove_task))
        .route("/task/{id}/events", get(task_events))
        .route("/task/{id}/approval", post(resolve_approval))
        .route("/task/{id}/cancel", post(cancel_task))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "marshal engine api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(input): Json<SubmitInput>,
) -> Result<Json<SubmitOutput>, ApiError> {
    if input.instruction.trim().is_empty() {
        return Err(ApiError::bad_request("instruction must not be empty"));
    }
    let task_id = state
        .registry
        .submit(SubmitRequest {
            instruction: input.instruction,
            context: input.context.unwrap_or_default(),
            options: TaskOptions {
                dry_run: input.dry_run,
                auto_approve: input.auto_approve,
                generate_preview: input.generate_preview,
            },
        })
        .await;
    Ok(Json(SubmitOutput { task_id }))
}

async fn list_tasks(State(state): State<AppState>) -> Json<TaskListOutput> {
    Json(TaskListOutput {
        tasks: state.registry.list().await,
    })
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.registry.snapshot(&id).await?))
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.registry.subscribe(&id).await?;
    let stream = subscription.into_stream().map(|frame| {
        let event = Event::default()
            .event("task")
            .json_data(&frame)
            .unwrap_or_else(|_| Event::default().event("task").data("{}"));
        Ok::<_, Infallible>(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ApprovalInput>,
) -> Result<StatusCode, ApiError> {
    let decision = match input.decision.trim().to_ascii_lowercase().as_str() {
        "approve" | "approved" => ApprovalDecision::Approved,
        "reject" | "rejected" => ApprovalDecision::Rejected,
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown approval decision `{other}`"
            )))
        }
    };
    state.registry.resolve_approval(&id, decision).await?;
    Ok(StatusCode::OK)
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.cancel(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.registry.remove(&id).await?))
}
