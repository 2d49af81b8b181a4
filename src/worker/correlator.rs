//! Request/response correlation over the worker line protocol.
//!
//! Each [`request`] gets an id of the form `<worker-id>-<n>`, is parked in
//! the worker's pending table and settled by [`resolve`] when a response
//! line with the same id arrives, or rejected on timeout or worker exit.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{ResponseLine, WorkerCommand};
use crate::worker::{Worker, WorkerState};
use crate::{AppError, Result};

/// Send `command` and await its correlated response.
///
/// Resolves with the response's `data` (or `null`).
///
/// # Errors
///
/// - [`AppError::WorkerOffline`]: the worker is offline; nothing was sent.
/// - [`AppError::Timeout`]: no response within `timeout`.
/// - [`AppError::Rejected`]: the worker answered `success: false`.
/// - [`AppError::WorkerExited`]: the process exited while waiting.
pub async fn request(worker: &Worker, command: WorkerCommand, timeout: Duration) -> Result<Value> {
    let id = worker.next_request_id();
    let line = command.to_value(Some(&id))?;
    let (tx, rx) = oneshot::channel();

    {
        let mut state = worker.lock();
        let sender = match state.process {
            Some(ref process) if !state.offline => process.tx.clone(),
            _ => {
                return Err(AppError::WorkerOffline(format!(
                    "worker '{}' is offline",
                    worker.id()
                )))
            }
        };
        state.pending.insert(id.clone(), tx);
        if sender.send(line).is_err() {
            state.pending.remove(&id);
            return Err(AppError::WorkerOffline(format!(
                "worker '{}' stdin is closed",
                worker.id()
            )));
        }
    }

    debug!(worker_id = worker.id(), request_id = %id, command = command.name(), "request sent");

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AppError::WorkerExited(format!(
            "request {id} dropped without a response"
        ))),
        Err(_) => {
            worker.lock().pending.remove(&id);
            Err(AppError::Timeout(format!(
                "{} request {id} timed out after {}ms",
                command.name(),
                timeout.as_millis()
            )))
        }
    }
}

/// Settle the pending request matching `line.id`.
///
/// Returns `false` when the line carries no id or the id is unknown (already
/// resolved, timed out or never issued); such lines change nothing.
pub fn resolve(worker: &Worker, line: &ResponseLine) -> bool {
    let Some(id) = line.id.as_deref() else {
        return false;
    };
    let Some(resolver) = worker.lock().pending.remove(id) else {
        debug!(worker_id = worker.id(), request_id = id, "response for unknown request id");
        return false;
    };

    let result = if line.success {
        Ok(line.data.clone().unwrap_or(Value::Null))
    } else {
        Err(AppError::Rejected(line.error.clone().unwrap_or_else(|| {
            format!(
                "{} failed",
                line.command.as_deref().unwrap_or("request")
            )
        })))
    };
    // The caller may have timed out already.
    let _ = resolver.send(result);
    true
}

/// Reject every pending request with `reason`. Returns how many were rejected.
pub(crate) fn reject_all(state: &mut WorkerState, reason: &str) -> usize {
    let pending = std::mem::take(&mut state.pending);
    let count = pending.len();
    for (_, resolver) in pending {
        let _ = resolver.send(Err(AppError::WorkerExited(reason.to_owned())));
    }
    count
}
