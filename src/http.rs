//! HTTP control surface.
//!
//! A programmatic channel (`POST /api/messages`), worker and session
//! inspection, session rename/delete and subagent spawning.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::Gateway;
use crate::models::session::{SessionIndexEntry, SessionSummary};
use crate::models::status::WorkerStatus;
use crate::models::subagent::SubagentRun;
use crate::models::task::{Task, TaskOrigin, TaskReply};
use crate::subagent::{spawn_subagent, SpawnOutcome, SpawnRequest, DEFAULT_SPAWN_TIMEOUT};
use crate::{AppError, Result};

/// Channel tag of tasks submitted over HTTP.
pub const HTTP_CHANNEL: &str = "http";

/// [`AppError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code for the wrapped error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::DepthExceeded(_) | AppError::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::PathViolation(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::WorkerOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Rejected(_) | AppError::WorkerExited(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Protocol(_)
            | AppError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Body of `POST /api/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    /// Prompt text.
    pub text: String,
    /// Explicit target worker; routed from the text otherwise.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Channel tag; defaults to `http`.
    #[serde(default)]
    pub channel: Option<String>,
    /// Conversation key for per-conversation session binding.
    #[serde(default)]
    pub conversation_key: Option<String>,
    /// Start on a fresh session.
    #[serde(default)]
    pub new_session: bool,
    /// Attachment references.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Reply wait limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Response of `POST /api/messages`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Task id.
    pub task_id: String,
    /// Worker that ran the task.
    pub worker_id: String,
    /// Reply text.
    pub reply: String,
    /// Attachment blocks.
    pub attachments: Vec<Value>,
}

/// Body of the session rename endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    /// Session file to rename.
    pub session_path: String,
    /// New label.
    pub label: String,
}

/// Body of the session delete endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// Session file to delete.
    pub session_path: String,
}

/// Body of `POST /api/subagents/spawn`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnBody {
    /// Child task text.
    pub task: String,
    /// Child worker id.
    pub agent_id: String,
    /// Parent worker id.
    pub parent_agent_id: String,
    /// Optional run label.
    #[serde(default)]
    pub label: Option<String>,
    /// Reply wait limit.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// `parent` or `direct`.
    #[serde(default)]
    pub reply_mode: Option<String>,
    /// Legacy direct-reply flag.
    #[serde(default)]
    pub direct_reply: Option<bool>,
}

/// Build the router.
pub fn router(gw: Gateway) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/workers", get(list_workers))
        .route("/api/messages", post(post_message))
        .route("/api/workers/{id}/sessions", get(list_sessions))
        .route("/api/workers/{id}/sessions/rename", post(rename_session))
        .route("/api/workers/{id}/sessions/delete", post(delete_session))
        .route("/api/subagents/spawn", post(spawn))
        .route("/api/subagents/runs", get(list_runs))
        .with_state(gw)
}

/// Serve the API on `127.0.0.1:port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or
/// `AppError::Io` if the server fails.
pub async fn serve(gw: Gateway, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting HTTP API");
    axum::serve(listener, router(gw))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))
}

async fn health() -> &'static str {
    "ok"
}

async fn list_workers(State(gw): State<Gateway>) -> Json<Vec<WorkerStatus>> {
    Json(gw.statuses())
}

async fn post_message(
    State(gw): State<Gateway>,
    Json(body): Json<MessageRequest>,
) -> ApiResult<MessageResponse> {
    let worker = match body.worker_id.as_deref() {
        Some(id) => gw.worker(id),
        None => gw.route(&body.text),
    }
    .ok_or_else(|| AppError::NotFound("no worker matches this message".into()))?;

    let origin = TaskOrigin {
        channel: body.channel.unwrap_or_else(|| HTTP_CHANNEL.to_owned()),
        conversation_key: body.conversation_key,
        ui_handle: None,
    };
    let slash = body.text.trim_start().starts_with('/');
    let (tx, rx) = oneshot::channel();
    let mut task = Task::new(origin, body.text)
        .with_attachments(body.attachments)
        .with_reply(move |reply| {
            let _ = tx.send(reply);
        });
    if slash {
        task = task.slash_command();
    }
    if body.new_session {
        task = task.fresh_session();
    }

    let wait = body
        .timeout_ms
        .map(Duration::from_millis)
        .or_else(|| worker.config().task_timeout())
        .unwrap_or(DEFAULT_SPAWN_TIMEOUT);
    let task_id = gw.enqueue(worker.id(), task)?;

    match tokio::time::timeout(wait, rx).await {
        Ok(Ok(TaskReply::Completed {
            text, attachments, ..
        })) => Ok(Json(MessageResponse {
            task_id,
            worker_id: worker.id().to_owned(),
            reply: text,
            attachments,
        })),
        Ok(Ok(TaskReply::Failed { message })) => Err(AppError::Rejected(message).into()),
        // Completed without a reply, e.g. a slash command answered out of band.
        Ok(Err(_)) => Ok(Json(MessageResponse {
            task_id,
            worker_id: worker.id().to_owned(),
            reply: String::new(),
            attachments: Vec::new(),
        })),
        Err(_) => Err(AppError::Timeout(format!("no reply within {}ms", wait.as_millis())).into()),
    }
}

async fn list_sessions(
    State(gw): State<Gateway>,
    Path(id): Path<String>,
) -> ApiResult<Vec<SessionSummary>> {
    Ok(Json(gw.list_sessions(&id)?))
}

async fn rename_session(
    State(gw): State<Gateway>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<SessionIndexEntry> {
    Ok(Json(
        gw.rename_session(&id, &body.session_path, &body.label)
            .await?,
    ))
}

async fn delete_session(
    State(gw): State<Gateway>,
    Path(id): Path<String>,
    Json(body): Json<DeleteRequest>,
) -> ApiResult<Value> {
    gw.delete_session(&id, &body.session_path)?;
    Ok(Json(json!({ "deleted": true })))
}

async fn spawn(State(gw): State<Gateway>, Json(body): Json<SpawnBody>) -> ApiResult<SpawnOutcome> {
    let request = SpawnRequest {
        parent_worker_id: body.parent_agent_id,
        child_worker_id: body.agent_id,
        task: body.task,
        label: body.label,
        timeout: body.timeout_ms.map(Duration::from_millis),
        reply_mode: body.reply_mode,
        direct_reply: body.direct_reply,
    };
    Ok(Json(spawn_subagent(&gw, request).await?))
}

async fn list_runs(State(gw): State<Gateway>) -> Json<Vec<SubagentRun>> {
    Json(gw.run_log().list())
}
