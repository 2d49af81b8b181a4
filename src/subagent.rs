//! Bounded-depth subagent spawning.
//!
//! A task running on one worker can dispatch a nested task onto another
//! worker and wait for its single reply. The child always starts on a
//! fresh session. Its reply either returns to the caller (`parent` mode)
//! or goes straight to the parent task's origin channel (`direct` mode).

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};

use crate::gateway::Gateway;
use crate::models::subagent::{ReplyMode, RunStatus, SubagentRun};
use crate::models::task::{Task, TaskOrigin, TaskReply};
use crate::{AppError, Result};

/// Channel tag of tasks created by the spawner.
pub const SUBAGENT_CHANNEL: &str = "subagent";

/// Reply wait used when neither the request nor the child configures one.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Input of [`spawn_subagent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Worker whose executing task is the parent.
    pub parent_worker_id: String,
    /// Worker that runs the child task.
    pub child_worker_id: String,
    /// Child task text.
    pub task: String,
    /// Optional run label.
    pub label: Option<String>,
    /// Reply wait limit.
    pub timeout: Option<Duration>,
    /// `parent` or `direct`.
    pub reply_mode: Option<String>,
    /// Legacy flag equivalent to `reply_mode = "direct"`.
    pub direct_reply: Option<bool>,
}

/// Successful spawn result.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    /// Run id.
    pub run_id: String,
    /// Child reply text.
    pub reply: String,
    /// Attachment blocks of the reply.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    /// Effective reply mode.
    pub reply_mode: ReplyMode,
    /// The reply already went to the origin channel.
    pub delivered_directly: bool,
}

/// Requested reply mode: explicit value, else the legacy flag, else parent.
///
/// # Errors
///
/// Returns [`AppError::InvalidRequest`] for an unknown mode string.
pub fn requested_reply_mode(reply_mode: Option<&str>, direct_reply: Option<bool>) -> Result<ReplyMode> {
    match reply_mode {
        Some(mode) => mode.parse(),
        None if direct_reply == Some(true) => Ok(ReplyMode::Direct),
        None => Ok(ReplyMode::Parent),
    }
}

/// Run `request.task` on the child worker on behalf of the parent's
/// executing task and wait for its reply.
///
/// # Errors
///
/// - [`AppError::NotFound`]: parent or child worker unknown.
/// - [`AppError::InvalidRequest`]: bad reply mode, or parent == child.
/// - [`AppError::Conflict`]: the parent worker has no executing task.
/// - [`AppError::Unauthorized`]: the child is not in the parent's allow-list.
/// - [`AppError::DepthExceeded`]: nesting would exceed the parent's limit.
/// - [`AppError::Timeout`]: no reply in time.
/// - [`AppError::WorkerOffline`] / [`AppError::Rejected`]: the child task
///   was rejected or failed.
pub async fn spawn_subagent(gw: &Gateway, request: SpawnRequest) -> Result<SpawnOutcome> {
    let parent = gw.worker(&request.parent_worker_id).ok_or_else(|| {
        AppError::NotFound(format!("parent worker '{}' not found", request.parent_worker_id))
    })?;
    let child = gw.worker(&request.child_worker_id).ok_or_else(|| {
        AppError::NotFound(format!("child worker '{}' not found", request.child_worker_id))
    })?;
    let requested = requested_reply_mode(request.reply_mode.as_deref(), request.direct_reply)?;
    let parent_task = parent.current_task().ok_or_else(|| {
        AppError::Conflict(format!("worker '{}' has no active task", parent.id()))
    })?;

    if !parent.may_spawn(child.id()) {
        return Err(AppError::Unauthorized(format!(
            "worker '{}' may not spawn onto '{}'",
            parent.id(),
            child.id()
        )));
    }
    if parent.id() == child.id() {
        return Err(AppError::InvalidRequest(
            "a worker cannot spawn a subagent onto itself".into(),
        ));
    }

    let depth = parent_task.depth + 1;
    let max_depth = parent.config().max_spawn_depth;
    if depth > max_depth {
        return Err(AppError::DepthExceeded(format!(
            "spawn depth {depth} exceeds the limit of {max_depth}"
        )));
    }

    let (reply_mode, direct_target) = match requested {
        ReplyMode::Direct
            if parent_task.origin.has_target() && gw.has_channel(&parent_task.origin.channel) =>
        {
            (ReplyMode::Direct, Some(parent_task.origin.clone()))
        }
        ReplyMode::Direct => {
            info!(parent = parent.id(), "no direct delivery target, replying through the parent");
            (ReplyMode::Parent, None)
        }
        ReplyMode::Parent => (ReplyMode::Parent, None),
    };

    let mut run = SubagentRun::new(
        parent.id(),
        &parent_task.task_id,
        child.id(),
        request.label.clone(),
        depth,
        requested,
        reply_mode,
        direct_target.clone(),
    );
    gw.run_log().record(&run);
    let run_id = run.run_id.clone();
    if let Some(target) = direct_target {
        gw.register_direct_reply(&run_id, target);
    }

    let wait = request
        .timeout
        .or_else(|| child.config().task_timeout())
        .unwrap_or(DEFAULT_SPAWN_TIMEOUT);

    let span = info_span!("subagent", run_id = %run_id, parent = parent.id(), child = child.id(), depth);
    let result = async {
        let (tx, rx) = oneshot::channel();
        let mut task = Task::new(
            TaskOrigin {
                channel: SUBAGENT_CHANNEL.to_owned(),
                conversation_key: Some(run_id.clone()),
                ui_handle: None,
            },
            request.task.clone(),
        )
        .fresh_session()
        .with_reply(move |reply| {
            let _ = tx.send(reply);
        });
        task.depth = depth;
        task.subagent_run_id = Some(run_id.clone());

        info!(reply_mode = ?reply_mode, "dispatching subagent task");
        gw.enqueue(child.id(), task)?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(TaskReply::Completed {
                text,
                attachments,
                delivered_directly,
            })) => Ok(SpawnOutcome {
                run_id: run_id.clone(),
                reply: text,
                attachments,
                reply_mode,
                delivered_directly,
            }),
            Ok(Ok(TaskReply::Failed { message })) => Err(AppError::Rejected(message)),
            Ok(Err(_)) => Err(AppError::Rejected(
                "subagent task finished without a reply".into(),
            )),
            Err(_) => Err(AppError::Timeout(format!(
                "subagent did not reply within {}ms",
                wait.as_millis()
            ))),
        }
    }
    .instrument(span)
    .await;

    gw.clear_direct_reply(&run_id);
    match result {
        Ok(ref outcome) => {
            run.finish(RunStatus::Done, None);
            info!(run_id = %outcome.run_id, "subagent run done");
        }
        Err(ref err) => {
            run.finish(RunStatus::Failed, Some(err.to_string()));
            warn!(run_id = %run_id, %err, "subagent run failed");
        }
    }
    gw.run_log().record(&run);
    result
}
