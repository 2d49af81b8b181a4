//! Worker process supervision.
//!
//! [`spawn`] (re)starts a worker's process and wires four tasks to it:
//! the stdin writer, the stdout reader, an exit monitor and an event
//! consumer. The reader settles correlated responses inline and hands
//! events to the consumer, so an event handler awaiting a request never
//! blocks the response it is waiting for. Any stream failure or process
//! exit is routed to the lifecycle manager, tagged with the process
//! generation so late signals from a replaced process are ignored.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::gateway::Gateway;
use crate::protocol::reader::{run_reader, ReaderExit};
use crate::protocol::writer::run_writer;
use crate::protocol::{InboundLine, WorkerCommand, WorkerEvent};
use crate::worker::launcher::LaunchedProcess;
use crate::worker::{correlator, events, lifecycle, scheduler, ProcessHandle, Worker};
use crate::Result;

/// Start (or restart) the worker's process.
///
/// The previous process's stream tasks are cancelled first. A launch
/// failure is handed to the lifecycle manager like an exit.
///
/// # Errors
///
/// Returns the launcher's error if the process could not be started.
pub async fn spawn(gw: &Gateway, worker: &Arc<Worker>) -> Result<()> {
    let span = info_span!("spawn", worker_id = %worker.id());
    async {
        let generation = {
            let mut state = worker.lock();
            if let Some(old) = state.process.take() {
                old.cancel.cancel();
            }
            if let Some(timer) = state.restart_timer.take() {
                timer.abort();
            }
            state.generation += 1;
            state.generation
        };

        let spec = worker.spawn_spec();
        info!(generation, command = %spec.command, args = ?spec.args, "spawning worker");

        let launched = match gw.launcher().launch(worker.id(), spec).await {
            Ok(launched) => launched,
            Err(err) => {
                error!(%err, "worker failed to launch");
                lifecycle::handle_exit(gw, worker, generation, &format!("spawn error: {err}"));
                return Err(err);
            }
        };

        wire(gw, worker, generation, launched);
        Ok(())
    }
    .instrument(span)
    .await
}

fn wire(gw: &Gateway, worker: &Arc<Worker>, generation: u64, launched: LaunchedProcess) {
    let LaunchedProcess {
        pid,
        stdin,
        stdout,
        exit,
    } = launched;

    let cancel = gw.shutdown_token().child_token();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    {
        let mut state = worker.lock();
        if state.generation != generation {
            debug!(generation, "superseded by a newer spawn");
            cancel.cancel();
            return;
        }
        state.process = Some(ProcessHandle {
            tx: msg_tx,
            cancel: cancel.clone(),
            pid,
        });
        state.offline = false;
    }

    // stdin writer
    {
        let gw = gw.clone();
        let worker = Arc::clone(worker);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_writer(worker.id(), stdin, msg_rx, cancel).await {
                lifecycle::handle_exit(&gw, &worker, generation, &err.to_string());
            }
        });
    }

    // stdout reader
    {
        let gw = gw.clone();
        let worker = Arc::clone(worker);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let sink_worker = Arc::clone(&worker);
            let sink = move |line: InboundLine| route_line(&sink_worker, &event_tx, line);
            match run_reader(worker.id(), stdout, sink, cancel).await {
                ReaderExit::Cancelled => {}
                ReaderExit::Closed => {
                    lifecycle::handle_exit(&gw, &worker, generation, "worker stdout closed");
                }
                ReaderExit::Failed(err) => {
                    lifecycle::handle_exit(
                        &gw,
                        &worker,
                        generation,
                        &format!("worker stdout failed: {err}"),
                    );
                }
            }
        });
    }

    // exit monitor
    {
        let gw = gw.clone();
        let worker = Arc::clone(worker);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = exit => {
                    lifecycle::handle_exit(&gw, &worker, generation, &reason);
                }
                () = cancel.cancelled() => {
                    debug!(worker_id = worker.id(), "exit monitor cancelled");
                }
            }
        });
    }

    // event consumer
    {
        let gw = gw.clone();
        let worker = Arc::clone(worker);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => events::handle_event(&gw, &worker, event).await,
                        None => break,
                    },
                }
            }
        });
    }

    info!(?pid, generation, "worker online");
    gw.notify_status(worker);
    scheduler::try_start_next(gw, worker);
}

fn route_line(worker: &Worker, event_tx: &mpsc::UnboundedSender<WorkerEvent>, line: InboundLine) {
    match line {
        InboundLine::Response(response) => {
            if !correlator::resolve(worker, &response) {
                debug!(worker_id = worker.id(), command = ?response.command, "uncorrelated response ignored");
            }
        }
        InboundLine::Event(WorkerEvent::AgentEnd { ref messages })
            if scheduler::settle_stale_run(worker, messages) =>
        {
            debug!(worker_id = worker.id(), "agent_end of an abandoned prompt ignored");
        }
        InboundLine::Event(event) => {
            if event.signals_work() {
                scheduler::mark_work_started(worker);
            }
            if event_tx.send(event).is_err() {
                debug!(worker_id = worker.id(), "event consumer gone, dropping event");
            }
        }
    }
}

/// Write `command` to the worker without waiting for an answer.
///
/// A no-op while the worker is offline. Write failures surface through
/// the writer task as a process exit.
pub fn send(worker: &Worker, command: &WorkerCommand) {
    let line = match command.to_value(None) {
        Ok(line) => line,
        Err(err) => {
            warn!(worker_id = worker.id(), %err, "failed to serialise command");
            return;
        }
    };

    let state = worker.lock();
    if state.offline {
        debug!(worker_id = worker.id(), command = command.name(), "worker offline, command dropped");
        return;
    }
    if let Some(ref process) = state.process {
        if process.tx.send(line).is_err() {
            debug!(worker_id = worker.id(), command = command.name(), "writer gone, command dropped");
        }
    }
}

/// Stop the worker's process and any pending restart.
pub fn stop(worker: &Worker) {
    let mut state = worker.lock();
    if let Some(timer) = state.restart_timer.take() {
        timer.abort();
    }
    if let Some(process) = state.process.take() {
        process.cancel.cancel();
    }
    if let Some(ref mut active) = state.current {
        active.abort_timers();
    }
    state.offline = true;
}
