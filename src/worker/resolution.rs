//! Session resolution before a prompt is sent.
//!
//! 1. Fresh session requested (outside per-conversation binding): create
//!    one, move it into the managed directory, index it and bind it.
//! 2. No per-conversation binding: adopt the worker's current session.
//! 3. Per-conversation binding: switch to the conversation's mapped
//!    session. A rejected switch forgets the mapping and falls through.
//! 4. Otherwise create a new session and bind the conversation to it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::task::TaskOrigin;
use crate::protocol::WorkerCommand;
use crate::sessions::{relocate, RelocateOutcome};
use crate::worker::{correlator, Worker};
use crate::{AppError, Result};

/// Bind `worker` to the right session for a task from `origin`.
///
/// # Errors
///
/// Propagates correlator failures (offline, timeout, rejected, exited).
/// Relocation and map persistence failures are logged, not returned.
pub async fn resolve_session(
    worker: &Worker,
    origin: &TaskOrigin,
    force_new_session: bool,
) -> Result<()> {
    let conversation_key = origin
        .conversation_key
        .as_deref()
        .filter(|_| worker.uses_per_conversation(&origin.channel));

    let Some(key) = conversation_key else {
        if force_new_session {
            let path = create_managed_session(worker).await?;
            bind(worker, path);
        } else {
            adopt_current_session(worker).await?;
        }
        return Ok(());
    };

    if let Some(mapped) = worker.conversation_session(key) {
        if worker.current_session().as_deref() == Some(mapped.as_path()) {
            debug!(conversation_key = key, "conversation already on its session");
            return Ok(());
        }
        let switched = switch_to(worker, &mapped).await;
        match switched {
            Ok(()) => {
                bind(worker, mapped);
                return Ok(());
            }
            Err(AppError::Rejected(err)) => {
                warn!(conversation_key = key, session_path = %mapped.display(), %err, "mapped session unusable, starting a new one");
                forget_conversation(worker, key);
            }
            Err(err) => return Err(err),
        }
    }

    let path = create_managed_session(worker).await?;
    bind(worker, path.clone());
    bind_conversation(worker, key, &path);
    Ok(())
}

/// Ask the worker for its current session and adopt it.
async fn adopt_current_session(worker: &Worker) -> Result<()> {
    let state = correlator::request(worker, WorkerCommand::GetState, worker.config().request_timeout()).await?;
    match session_file(&state) {
        Some(path) => bind(worker, path),
        None => debug!(worker_id = worker.id(), "worker reported no session file"),
    }
    Ok(())
}

/// Start a new session on the worker and move it into the managed root.
///
/// Returns the path the worker ends up bound to. If the worker's file is
/// missing (not written yet) or cannot be moved, the worker's own path is
/// kept.
///
/// # Errors
///
/// Propagates correlator failures, and [`AppError::Session`] if the worker
/// reports no session file.
pub async fn create_managed_session(worker: &Worker) -> Result<PathBuf> {
    let timeout = worker.config().request_timeout();
    correlator::request(worker, WorkerCommand::NewSession, timeout).await?;
    let state = correlator::request(worker, WorkerCommand::GetState, timeout).await?;
    let reported = session_file(&state).ok_or_else(|| {
        AppError::Session("worker reported no session file after new_session".into())
    })?;

    let target = worker.sessions().create_path(Utc::now());
    let path = match relocate(&reported, &target.session_path) {
        RelocateOutcome::Moved { via_copy } => {
            debug!(from = %reported.display(), to = %target.session_path.display(), via_copy, "session relocated");
            switch_to(worker, &target.session_path).await?;
            target.session_path
        }
        RelocateOutcome::Unchanged => target.session_path,
        RelocateOutcome::Missing => {
            debug!(session_path = %reported.display(), "new session file not written yet, keeping worker path");
            reported
        }
        RelocateOutcome::Failed(err) => {
            warn!(session_path = %reported.display(), %err, "session relocation failed, keeping worker path");
            reported
        }
    };

    if let Err(err) = worker.sessions().upsert(&path, Some(&target.label)) {
        debug!(session_path = %path.display(), %err, "session not indexed");
    }
    worker.invalidate_session_list();
    info!(worker_id = worker.id(), session_path = %path.display(), "new session created");
    Ok(path)
}

/// Switch the live worker onto `path`.
///
/// # Errors
///
/// Whatever the correlated request returns; [`AppError::Rejected`] when
/// the worker refuses the file.
pub async fn switch_to(worker: &Worker, path: &Path) -> Result<()> {
    correlator::request(
        worker,
        WorkerCommand::SwitchSession {
            session_path: path.to_string_lossy().into_owned(),
        },
        worker.config().request_timeout(),
    )
    .await?;
    Ok(())
}

fn bind(worker: &Worker, path: PathBuf) {
    worker.lock().current_session = Some(path);
}

fn bind_conversation(worker: &Worker, key: &str, path: &Path) {
    let map = {
        let mut state = worker.lock();
        state
            .conversation_sessions
            .entries
            .insert(key.to_owned(), path.to_string_lossy().into_owned());
        state.conversation_sessions.clone()
    };
    worker.persist_conversation_map(&map);
}

fn forget_conversation(worker: &Worker, key: &str) {
    let map = {
        let mut state = worker.lock();
        state.conversation_sessions.entries.remove(key);
        state.conversation_sessions.clone()
    };
    worker.persist_conversation_map(&map);
}

/// `sessionFile` from a `get_state` response.
#[must_use]
pub fn session_file(state: &Value) -> Option<PathBuf> {
    state
        .get("sessionFile")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}
