//! Handling of uncorrelated worker events.
//!
//! Events arrive in order on the worker's event consumer task. Only
//! `agent_end`, extension UI requests and subagent requests need work
//! here; the work signal carried by `agent_start`/`message_*` is applied
//! by the reader as soon as the line arrives.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::models::task::{ReplySink, TaskOrigin, TaskReply};
use crate::protocol::message::{extract_assistant_output, AssistantOutput, SubagentRequest};
use crate::protocol::{WorkerCommand, WorkerEvent};
use crate::subagent::{spawn_subagent, SpawnRequest};
use crate::worker::scheduler::{self, messages_in};
use crate::worker::{correlator, supervisor, Worker};

/// Dialog methods answered as cancelled; there is no UI at gateway level.
const DIALOG_METHODS: &[&str] = &["select", "confirm", "input", "editor"];

/// Dispatch one worker event.
pub async fn handle_event(gw: &Gateway, worker: &Arc<Worker>, event: WorkerEvent) {
    match event {
        WorkerEvent::AgentEnd { messages } => on_agent_end(gw, worker, &messages).await,
        WorkerEvent::ExtensionUiRequest {
            id,
            method,
            message,
            title,
        } => on_ui_request(gw, worker, id, &method, message.or(title)),
        WorkerEvent::SubagentRequest(request) => on_subagent_request(gw, worker, request),
        WorkerEvent::AgentStart
        | WorkerEvent::MessageStart
        | WorkerEvent::MessageUpdate
        | WorkerEvent::MessageEnd { .. } => {}
        WorkerEvent::Unknown { kind } => {
            debug!(worker_id = worker.id(), kind = %kind, "ignoring worker event");
        }
    }
}

async fn on_agent_end(gw: &Gateway, worker: &Arc<Worker>, event_messages: &[Value]) {
    let prompted = {
        let state = worker.lock();
        state
            .current
            .as_ref()
            .and_then(|active| active.snapshot.map(|snap| (active.task.id.clone(), snap)))
    };
    let Some((task_id, snapshot)) = prompted else {
        debug!(worker_id = worker.id(), "agent_end without a prompted task");
        return;
    };

    let output = match correlator::request(
        worker,
        WorkerCommand::GetMessages,
        worker.config().request_timeout(),
    )
    .await
    {
        Ok(data) => {
            let all = messages_in(&data);
            extract_assistant_output(all.get(snapshot..).unwrap_or_default())
        }
        Err(err) => {
            warn!(worker_id = worker.id(), task_id = %task_id, %err, "get_messages failed, using agent_end payload");
            extract_assistant_output(event_messages)
        }
    };

    let claimed = {
        let mut state = worker.lock();
        match state.current {
            Some(ref mut active) if active.task.id == task_id => Some((
                active.task.claim_reply(),
                active.task.origin.clone(),
                active.task.subagent_run_id.clone(),
            )),
            _ => None,
        }
    };
    let Some((claim, origin, run_id)) = claimed else {
        debug!(worker_id = worker.id(), task_id = %task_id, "task finished before its reply was ready");
        return;
    };

    match claim {
        Some(sink) => deliver_reply(gw, sink, &origin, run_id.as_deref(), output).await,
        None => debug!(task_id = %task_id, "reply already sent"),
    }
    scheduler::complete(gw, worker, &task_id, false);
}

async fn deliver_reply(
    gw: &Gateway,
    sink: Option<ReplySink>,
    origin: &TaskOrigin,
    run_id: Option<&str>,
    output: AssistantOutput,
) {
    let mut delivered_directly = false;
    if let Some(target) = run_id.and_then(|run_id| gw.take_direct_reply(run_id)) {
        match gw.deliver(&target, &output.text).await {
            Ok(()) => delivered_directly = true,
            Err(err) => warn!(run_id, %err, "direct reply failed, returning it to the parent"),
        }
    }

    match sink {
        Some(sink) => sink(TaskReply::Completed {
            text: output.text,
            attachments: output.attachments,
            delivered_directly,
        }),
        None if output.text.is_empty() => debug!("empty reply, nothing to deliver"),
        None => {
            if let Err(err) = gw.deliver(origin, &output.text).await {
                warn!(channel = %origin.channel, %err, "reply delivery failed");
            }
        }
    }
}

fn on_ui_request(gw: &Gateway, worker: &Worker, id: String, method: &str, text: Option<String>) {
    if method == "notify" {
        let origin = worker.current_task().map(|task| task.origin);
        match (origin, text) {
            (Some(origin), Some(text)) => gw.deliver_detached(&origin, text),
            _ => debug!(worker_id = worker.id(), "notification with no task or text dropped"),
        }
    } else if DIALOG_METHODS.contains(&method) {
        debug!(worker_id = worker.id(), method, "cancelling dialog request");
        supervisor::send(
            worker,
            &WorkerCommand::ExtensionUiResponse {
                id,
                cancelled: true,
            },
        );
    } else {
        debug!(worker_id = worker.id(), method, "ignoring extension UI request");
    }
}

fn on_subagent_request(gw: &Gateway, worker: &Arc<Worker>, request: SubagentRequest) {
    let gw = gw.clone();
    let worker = Arc::clone(worker);
    tokio::spawn(async move {
        info!(worker_id = worker.id(), child = %request.agent_id, "worker requested a subagent");
        let spawn = SpawnRequest {
            parent_worker_id: worker.id().to_owned(),
            child_worker_id: request.agent_id,
            task: request.task,
            label: request.label,
            timeout: request.timeout_ms.map(Duration::from_millis),
            reply_mode: request.reply_mode,
            direct_reply: request.direct_reply,
        };

        let answer = match spawn_subagent(&gw, spawn).await {
            Ok(outcome) => WorkerCommand::SubagentResult {
                id: request.id,
                success: true,
                data: serde_json::to_value(&outcome).ok(),
                error: None,
            },
            Err(err) => WorkerCommand::SubagentResult {
                id: request.id,
                success: false,
                data: None,
                error: Some(err.to_string()),
            },
        };
        supervisor::send(&worker, &answer);
    });
}
