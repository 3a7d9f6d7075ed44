use crate::{
    emergency::{EmergencyControl, SweepReport},
    history::TaskHistory,
    queue::TaskQueue,
    readiness::ReadinessGate,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lynx_core::{AGENTS, Task, TaskId, TaskKind, TaskPriority, now_ms};
use lynx_protocol::{ControlStatus, HealthSnapshot, StatusSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub control: EmergencyControl,
    pub readiness: ReadinessGate,
    pub queue: Arc<Mutex<TaskQueue>>,
    pub history: Arc<Mutex<TaskHistory>>,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiErrorBody { ok: false, error: self.message })).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ControlRequest {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(rename = "type")]
    kind: TaskKind,
    priority: Option<TaskPriority>,
    agent_id: Option<String>,
    #[serde(default)]
    dependencies: Vec<TaskId>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/control/status", get(control_status))
        .route("/v1/control/stop", post(control_stop))
        .route("/v1/control/resume", post(control_resume))
        .route("/v1/control/degrade", post(control_degrade))
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.readiness.liveness() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "down")
    }
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.readiness.readiness().await;
    let status = if snapshot.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(snapshot))
}

async fn control_status(State(state): State<AppState>) -> Json<ControlStatus> {
    Json(state.control.status().await)
}

async fn control_stop(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SweepReport>), ApiError> {
    let request = parse_control(&body)?;
    Ok(sweep_response(state.control.stop(request.reason.as_deref()).await))
}

async fn control_resume(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SweepReport>), ApiError> {
    let request = parse_control(&body)?;
    Ok(sweep_response(state.control.resume(request.reason.as_deref()).await))
}

async fn control_degrade(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SweepReport>), ApiError> {
    let request = parse_control(&body)?;
    Ok(sweep_response(state.control.degrade(request.reason.as_deref()).await))
}

/// The reason body is optional, so an empty request is accepted as-is.
fn parse_control(body: &[u8]) -> Result<ControlRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ControlRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid body: {err}")))
}

fn sweep_response(report: SweepReport) -> (StatusCode, Json<SweepReport>) {
    let status = if report.is_clean() { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (status, Json(report))
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let agent_id = match request.agent_id {
        Some(agent) if AGENTS.contains(&agent.as_str()) => agent,
        Some(agent) => return Err(ApiError::bad_request(format!("unknown agent_id {agent}"))),
        None => request.kind.default_agent().to_string(),
    };

    {
        let queue = state.queue.lock().await;
        if let Some(missing) = request.dependencies.iter().find(|dep| !queue.knows(dep)) {
            return Err(ApiError::bad_request(format!("unknown dependency {missing}")));
        }
    }

    let task = Task::new(request.kind, agent_id)
        .with_priority(request.priority.unwrap_or_default())
        .with_dependencies(request.dependencies);

    state.history.lock().await.record(task.clone());
    state.queue.lock().await.enqueue(task.clone());
    info!(task_id = %task.id, kind = %task.kind, agent_id = %task.agent_id, "task enqueued via api");
    Ok(Json(task))
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.history.lock().await.snapshot())
}

async fn get_status(State(state): State<AppState>) -> Json<StatusSummary> {
    Json(state.history.lock().await.summary(now_ms()))
}
