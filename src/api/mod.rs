use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::QueueError;
use crate::health::HealthMonitor;
use crate::queue::{EmailPayload, Job, JobKind, JobStatus, QueueManager};
use crate::scheduler::Scheduler;
use crate::worker::WorkerPool;

pub struct ApiState {
    pub queue: Arc<QueueManager>,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthMonitor>,
}

/// Fields are optional so a missing field surfaces as a 400 with a
/// message instead of a body-rejection.
#[derive(Deserialize)]
struct SubmitEmailRequest {
    to: Option<String>,
    subject: Option<String>,
    body: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitEmailResponse {
    job_id: Uuid,
    status: JobStatus,
    created_at: DateTime<Utc>,
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    id: Uuid,
    #[serde(rename = "type")]
    kind: JobKind,
    status: JobStatus,
    attempts: u32,
    max_attempts: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs/email", post(submit_email))
        .route("/jobs/:id", get(get_job))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the token is cancelled, then drain existing
/// connections.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    token: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn submit_email(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SubmitEmailRequest>,
) -> Response {
    let payload = match validate_email_request(request) {
        Ok(payload) => payload,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let payload_value = match serde_json::to_value(&payload) {
        Ok(value) => value,
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };
    match state
        .queue
        .create_job(JobKind::SendEmail, payload_value, None)
        .await
    {
        Ok(job) => (
            StatusCode::CREATED,
            Json(SubmitEmailResponse {
                job_id: job.id,
                status: job.status,
                created_at: job.created_at,
                message: "Job accepted",
            }),
        )
            .into_response(),
        Err(QueueError::QueueFull(capacity)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("queue is full (capacity {capacity})"),
        ),
        Err(err) => {
            tracing::error!(error = %err, "Job submission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn get_job(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid job id");
    };
    match state.queue.get_job(id).await {
        Some(job) => (StatusCode::OK, Json(JobView::from(job))).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("job not found: {id}")),
    }
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let report = state
        .health
        .report(&state.queue, &state.pool, &state.scheduler)
        .await;
    (StatusCode::OK, Json(report)).into_response()
}

fn validate_email_request(request: SubmitEmailRequest) -> Result<EmailPayload, String> {
    let to = required_field(request.to, "to")?;
    let subject = required_field(request.subject, "subject")?;
    let body = required_field(request.body, "body")?;
    if !is_valid_email(&to) {
        return Err(format!("invalid email address: {to}"));
    }
    Ok(EmailPayload { to, subject, body })
}

fn required_field(value: Option<String>, name: &str) -> Result<String, String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(format!("missing required field: {name}")),
    }
}

/// Accepts the same addresses as `^[^\s@]+@[^\s@]+\.[^\s@]+$`: no
/// whitespace, exactly one `@`, and a dot inside the domain.
fn is_valid_email(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i < domain.len() - 1)
}
