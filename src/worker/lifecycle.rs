//! Worker exit handling and restart scheduling.
//!
//! Online → (exit/error) → Offline → (restart timer) → respawn → Online.
//! The bound session and any abandoned prompts die with the process.
//! Exit handling is idempotent: a second signal for the same process
//! generation, or any signal from a replaced process, changes nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::models::task::TaskState;
use crate::worker::scheduler::{deliver_failure, USER_MSG_DROPPED, USER_MSG_EXITED};
use crate::worker::{correlator, supervisor, Worker};

/// React to the worker's process exiting (or failing to start).
///
/// Marks the worker offline, rejects every pending request, drops the
/// queue, fails the executing task and schedules a restart. Returns
/// `false` when the call was ignored as stale or duplicate.
pub fn handle_exit(gw: &Gateway, worker: &Arc<Worker>, generation: u64, reason: &str) -> bool {
    let restart_enabled = worker.config().restart_delay().is_some();

    let (rejected, dropped, current) = {
        let mut state = worker.lock();
        if generation != state.generation {
            debug!(worker_id = worker.id(), generation, current = state.generation, "stale exit signal ignored");
            return false;
        }
        if state.offline && (state.restart_timer.is_some() || !restart_enabled) {
            debug!(worker_id = worker.id(), reason, "worker already offline, exit ignored");
            return false;
        }

        state.offline = true;
        if let Some(process) = state.process.take() {
            process.cancel.cancel();
        }
        state.session_list = None;
        // A respawned process boots on its own session.
        state.current_session = None;
        state.stale_runs = 0;
        let rejected = correlator::reject_all(&mut state, reason);
        let dropped = std::mem::take(&mut state.queue);
        let current = state.current.take();
        (rejected, dropped, current)
    };

    warn!(
        worker_id = worker.id(),
        reason,
        rejected_requests = rejected,
        dropped_tasks = dropped.len(),
        in_flight = current.is_some(),
        "worker exited"
    );

    if let Some(mut active) = current {
        active.abort_timers();
        active.task.transition(TaskState::Failed);
        deliver_failure(gw, &mut active.task, USER_MSG_EXITED);
    }
    for mut task in dropped {
        task.transition(TaskState::Failed);
        deliver_failure(gw, &mut task, USER_MSG_DROPPED);
    }

    schedule_restart(gw, worker, generation);
    gw.notify_status(worker);
    true
}

/// Arm the restart timer for an offline worker.
fn schedule_restart(gw: &Gateway, worker: &Arc<Worker>, generation: u64) {
    let Some(delay) = worker.config().restart_delay() else {
        info!(worker_id = worker.id(), "auto-restart disabled, worker stays offline");
        return;
    };
    if gw.shutdown_token().is_cancelled() {
        return;
    }

    let mut state = worker.lock();
    if !state.offline || state.generation != generation || state.restart_timer.is_some() {
        return;
    }

    info!(worker_id = worker.id(), delay_ms = delay.as_millis(), "restart scheduled");
    let timer_gw = gw.clone();
    let timer_worker = Arc::clone(worker);
    // Spawned while the lock is held so the timer cannot clear its own
    // handle before it is stored.
    state.restart_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        timer_worker.lock().restart_timer = None;
        if timer_gw.shutdown_token().is_cancelled() {
            return;
        }
        if let Err(err) = supervisor::spawn(&timer_gw, &timer_worker).await {
            warn!(worker_id = timer_worker.id(), %err, "restart failed");
        }
    }));
}
