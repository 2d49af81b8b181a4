//! Per-worker task scheduling.
//!
//! Each worker runs at most one task at a time, taken from its queue in
//! strict FIFO order. Promotion starts the task timers, binds a session,
//! snapshots the message count and sends the prompt. [`complete`] and
//! [`fail`] are guarded by task id so a late timer or event for a task
//! that already left the executing state is a no-op.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::gateway::Gateway;
use crate::models::task::{OnStartHook, Task, TaskOrigin, TaskReply, TaskState};
use crate::protocol::WorkerCommand;
use crate::worker::{correlator, resolution, supervisor, ActiveTask, Worker};
use crate::{AppError, Result};

/// Sent when a task is submitted to an offline worker.
pub const USER_MSG_OFFLINE: &str = "The agent is offline right now. Please try again shortly.";
/// Sent when a task exceeds its overall timeout.
pub const USER_MSG_TIMEOUT: &str = "Sorry, the agent took too long to respond.";
/// Sent when session binding or the pre-prompt snapshot fails.
pub const USER_MSG_START_FAILED: &str = "Sorry, the agent failed to start working on this.";
/// Sent when the worker process exits mid-task.
pub const USER_MSG_EXITED: &str = "The agent process exited unexpectedly. Please try again.";
/// Sent for queued tasks discarded because the worker exited.
pub const USER_MSG_DROPPED: &str = "The agent restarted before getting to this. Please resend it.";

/// Everything `run_task` needs, copied out of the locked state.
struct StartInfo {
    origin: TaskOrigin,
    text: String,
    attachments: Vec<String>,
    force_new_session: bool,
    on_start: Option<OnStartHook>,
}

/// Submit `task` to `worker`.
///
/// # Errors
///
/// Returns [`AppError::WorkerOffline`] if the worker is offline; the task's
/// reply callback (or origin channel) is told before returning.
pub fn enqueue(gw: &Gateway, worker: &Arc<Worker>, mut task: Task) -> Result<String> {
    if task.id.is_empty() {
        task.id = uuid::Uuid::new_v4().to_string();
    }
    let task_id = task.id.clone();

    let rejected = {
        let mut state = worker.lock();
        if state.offline {
            Some(task)
        } else {
            state.queue.push_back(task);
            None
        }
    };

    if let Some(mut task) = rejected {
        info!(worker_id = worker.id(), task_id = %task_id, "worker offline, task rejected");
        task.transition(TaskState::Failed);
        deliver_failure(gw, &mut task, USER_MSG_OFFLINE);
        gw.notify_status(worker);
        return Err(AppError::WorkerOffline(format!(
            "worker '{}' is offline",
            worker.id()
        )));
    }

    debug!(worker_id = worker.id(), task_id = %task_id, "task queued");
    try_start_next(gw, worker);
    gw.notify_status(worker);
    Ok(task_id)
}

/// Promote the head of the queue if the worker is online and idle.
pub fn try_start_next(gw: &Gateway, worker: &Arc<Worker>) {
    let task_id = {
        let mut state = worker.lock();
        if state.offline || state.current.is_some() {
            return;
        }
        let Some(mut task) = state.queue.pop_front() else {
            return;
        };
        task.transition(TaskState::Executing);
        let task_id = task.id.clone();
        let slash = task.slash_command;

        let mut active = ActiveTask::new(task);
        active.timeout_timer = worker.config().task_timeout().map(|after| {
            spawn_timer(gw, worker, &task_id, after, |gw, worker, task_id| {
                warn!(worker_id = worker.id(), task_id, "task timed out");
                fail(gw, worker, task_id, USER_MSG_TIMEOUT, false);
            })
        });
        if slash {
            active.slash_timer = worker.config().slash_command_timeout().map(|after| {
                spawn_timer(gw, worker, &task_id, after, slash_timeout_fired)
            });
        }
        state.current = Some(active);
        task_id
    };

    tokio::spawn(run_task(gw.clone(), Arc::clone(worker), task_id));
}

fn spawn_timer(
    gw: &Gateway,
    worker: &Arc<Worker>,
    task_id: &str,
    after: Duration,
    on_fire: fn(&Gateway, &Arc<Worker>, &str),
) -> tokio::task::JoinHandle<()> {
    let gw = gw.clone();
    let worker = Arc::clone(worker);
    let task_id = task_id.to_owned();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        on_fire(&gw, &worker, &task_id);
    })
}

/// Slash commands answered entirely out of band never start substantive
/// work; complete them silently when their short timer fires.
fn slash_timeout_fired(gw: &Gateway, worker: &Arc<Worker>, task_id: &str) {
    let idle = worker
        .lock()
        .current
        .as_ref()
        .is_some_and(|active| active.task.id == task_id && !active.started_work);
    if idle {
        debug!(worker_id = worker.id(), task_id, "slash command produced no work, completing");
        complete(gw, worker, task_id, false);
    }
}

async fn run_task(gw: Gateway, worker: Arc<Worker>, task_id: String) {
    let span = info_span!("task", worker_id = %worker.id(), task_id = %task_id);
    async move {
        let start = {
            let state = worker.lock();
            match state.current {
                Some(ref active) if active.task.id == task_id => StartInfo {
                    origin: active.task.origin.clone(),
                    text: active.task.text.clone(),
                    attachments: active.task.attachments.clone(),
                    force_new_session: active.task.force_new_session,
                    on_start: active.task.on_start(),
                },
                _ => return,
            }
        };

        if let Some(hook) = start.on_start.as_ref() {
            if let Err(err) = hook(&task_id, &start.origin) {
                warn!(%err, "on_start hook failed");
            }
        }

        if let Err(err) = prepare_and_prompt(&worker, &task_id, start).await {
            warn!(%err, "task failed to start");
            fail(&gw, &worker, &task_id, USER_MSG_START_FAILED, false);
        }
    }
    .instrument(span)
    .await;
}

async fn prepare_and_prompt(
    worker: &Arc<Worker>,
    task_id: &str,
    start: StartInfo,
) -> Result<()> {
    resolution::resolve_session(worker, &start.origin, start.force_new_session).await?;

    let data = correlator::request(
        worker,
        WorkerCommand::GetMessages,
        worker.config().request_timeout(),
    )
    .await?;
    let count = messages_in(&data).len();

    let still_current = {
        let mut state = worker.lock();
        match state.current {
            Some(ref mut active) if active.task.id == task_id => {
                active.snapshot = Some(count);
                true
            }
            _ => false,
        }
    };
    if !still_current {
        debug!("task left the executing state before its prompt was sent");
        return Ok(());
    }

    info!(snapshot = count, "sending prompt");
    supervisor::send(
        worker,
        &WorkerCommand::Prompt {
            message: start.text,
            attachments: start.attachments,
        },
    );
    Ok(())
}

/// Message list carried by a `get_messages` response.
#[must_use]
pub fn messages_in(data: &Value) -> &[Value] {
    data.get("messages")
        .and_then(Value::as_array)
        .or_else(|| data.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Record that the executing task started substantive work.
///
/// Disarms the slash-command timer. Ignored while an abandoned prompt is
/// still running, since the signal belongs to that prompt.
pub fn mark_work_started(worker: &Worker) {
    let mut state = worker.lock();
    if state.stale_runs > 0 {
        return;
    }
    if let Some(ref mut active) = state.current {
        if !active.started_work {
            active.started_work = true;
            if let Some(timer) = active.slash_timer.take() {
                timer.abort();
            }
        }
    }
}

/// Account an `agent_end` against the oldest abandoned prompt, if any.
///
/// Returns `true` when the event belonged to an abandoned prompt and must
/// not complete the executing task. The executing task's snapshot is
/// advanced past the abandoned prompt's messages so they stay out of its
/// reply.
pub(crate) fn settle_stale_run(worker: &Worker, messages: &[Value]) -> bool {
    let mut state = worker.lock();
    if state.stale_runs == 0 {
        return false;
    }
    state.stale_runs -= 1;
    if let Some(snapshot) = state.current.as_mut().and_then(|a| a.snapshot.as_mut()) {
        *snapshot += messages.len();
    }
    true
}

/// Finish the executing task `task_id` normally.
///
/// Returns `false` if `task_id` is not the executing task. Unless
/// `skip_queue` is set, the next queued task is promoted.
pub fn complete(gw: &Gateway, worker: &Arc<Worker>, task_id: &str, skip_queue: bool) -> bool {
    let Some(mut active) = take_current(worker, task_id, false) else {
        return false;
    };
    active.abort_timers();
    active.task.transition(TaskState::Completed);
    debug!(worker_id = worker.id(), task_id, "task completed");
    drop(active);

    if !skip_queue {
        try_start_next(gw, worker);
    }
    gw.notify_status(worker);
    true
}

/// Fail the executing task `task_id`, delivering `message` to its origin.
///
/// Returns `false` if `task_id` is not the executing task.
pub fn fail(
    gw: &Gateway,
    worker: &Arc<Worker>,
    task_id: &str,
    message: &str,
    skip_queue: bool,
) -> bool {
    let Some(mut active) = take_current(worker, task_id, true) else {
        return false;
    };
    active.abort_timers();
    active.task.transition(TaskState::Failed);
    info!(worker_id = worker.id(), task_id, message, "task failed");
    deliver_failure(gw, &mut active.task, message);

    if !skip_queue {
        try_start_next(gw, worker);
    }
    gw.notify_status(worker);
    true
}

/// Take the executing task if it is `task_id`.
///
/// With `abandon_run`, a prompt the worker is still running is recorded
/// as stale. Out-of-band slash commands that never started work have no
/// run to wait for.
fn take_current(worker: &Worker, task_id: &str, abandon_run: bool) -> Option<ActiveTask> {
    let mut state = worker.lock();
    if !state
        .current
        .as_ref()
        .is_some_and(|active| active.task.id == task_id)
    {
        return None;
    }
    let active = state.current.take()?;
    if abandon_run
        && active.snapshot.is_some()
        && (active.started_work || !active.task.slash_command)
    {
        state.stale_runs += 1;
    }
    Some(active)
}

/// Tell the task's reply callback, or failing that its origin channel,
/// that it failed. A no-op if a reply already went out.
pub(crate) fn deliver_failure(gw: &Gateway, task: &mut Task, message: &str) {
    match task.claim_reply() {
        None => debug!(task_id = %task.id, "reply already sent, failure not delivered"),
        Some(Some(sink)) => sink(TaskReply::Failed {
            message: message.to_owned(),
        }),
        Some(None) => gw.deliver_detached(&task.origin, message.to_owned()),
    }
}
