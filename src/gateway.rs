//! The gateway aggregate.
//!
//! [`Gateway`] owns every worker, the channel adapter registry, the
//! direct-reply registrations, the subagent run log and the status
//! broadcast. It is a cheap `Clone` handle passed to every component; there
//! is no ambient global state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::ChannelAdapter;
use crate::config::GlobalConfig;
use crate::models::session::{SessionIndexEntry, SessionSummary};
use crate::models::status::WorkerStatus;
use crate::models::task::{Task, TaskOrigin};
use crate::persistence::run_log::SubagentRunLog;
use crate::worker::{resolution, scheduler, supervisor, Launcher, Worker};
use crate::{AppError, Result};

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 256;

struct GatewayInner {
    config: GlobalConfig,
    workers: Vec<Arc<Worker>>,
    launcher: Arc<dyn Launcher>,
    channels: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    direct_replies: Mutex<HashMap<String, TaskOrigin>>,
    run_log: SubagentRunLog,
    status_tx: broadcast::Sender<WorkerStatus>,
    shutdown: CancellationToken,
}

/// Shared handle to the gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("workers", &self.inner.workers.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build the gateway and its workers. Nothing is spawned yet.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if a worker's session directory cannot be
    /// created.
    pub fn new(config: GlobalConfig, launcher: Arc<dyn Launcher>) -> Result<Self> {
        let workers = config
            .workers
            .iter()
            .map(|wc| Worker::new(wc.clone(), &config.session_dir(wc)).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let run_log = SubagentRunLog::open(config.subagent_log_path());
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                workers,
                launcher,
                channels: RwLock::new(HashMap::new()),
                direct_replies: Mutex::new(HashMap::new()),
                run_log,
                status_tx,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Spawn every worker process. Launch failures schedule a restart.
    pub async fn start(&self) {
        for worker in &self.inner.workers {
            if let Err(err) = supervisor::spawn(self, worker).await {
                warn!(worker_id = worker.id(), %err, "worker did not start");
            }
        }
        info!(workers = self.inner.workers.len(), "gateway started");
    }

    /// Stop all workers and background tasks.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for worker in &self.inner.workers {
            supervisor::stop(worker);
        }
        info!("gateway stopped");
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    pub(crate) fn launcher(&self) -> &dyn Launcher {
        self.inner.launcher.as_ref()
    }

    /// All workers, in configuration order.
    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.inner.workers
    }

    /// Look up a worker by id.
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<Arc<Worker>> {
        self.inner.workers.iter().find(|w| w.id() == id).cloned()
    }

    fn require_worker(&self, id: &str) -> Result<Arc<Worker>> {
        self.worker(id)
            .ok_or_else(|| AppError::NotFound(format!("worker '{id}' not found")))
    }

    /// Subagent run log.
    #[must_use]
    pub fn run_log(&self) -> &SubagentRunLog {
        &self.inner.run_log
    }

    // ── Routing & submission ─────────────────────────────────────────────

    /// Pick the worker for `text`: an `@id`/`@name` mention first, then the
    /// first worker with a matching keyword, then the default worker.
    #[must_use]
    pub fn route(&self, text: &str) -> Option<Arc<Worker>> {
        let lowered = text.to_lowercase();
        let is_word = |c: char| c.is_alphanumeric() || c == '-' || c == '_';

        for token in lowered.split_whitespace() {
            let Some(mention) = token.strip_prefix('@') else {
                continue;
            };
            let mention = mention.trim_end_matches(|c: char| !is_word(c));
            if let Some(worker) = self.inner.workers.iter().find(|w| {
                w.id().eq_ignore_ascii_case(mention) || w.name().to_lowercase() == mention
            }) {
                return Some(Arc::clone(worker));
            }
        }

        let words: Vec<&str> = lowered.split(|c: char| !is_word(c)).filter(|w| !w.is_empty()).collect();
        for worker in &self.inner.workers {
            let hit = worker.config().keywords.iter().any(|keyword| {
                let keyword = keyword.to_lowercase();
                if keyword.contains(char::is_whitespace) {
                    lowered.contains(&keyword)
                } else {
                    words.contains(&keyword.as_str())
                }
            });
            if hit {
                return Some(Arc::clone(worker));
            }
        }

        self.inner
            .config
            .default_worker
            .as_deref()
            .and_then(|id| self.worker(id))
    }

    /// Submit `task` to the worker `worker_id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`]: no such worker.
    /// - [`AppError::WorkerOffline`]: the worker is offline; the task's
    ///   reply callback has already been told.
    pub fn enqueue(&self, worker_id: &str, task: Task) -> Result<String> {
        let worker = self.require_worker(worker_id)?;
        scheduler::enqueue(self, &worker, task)
    }

    // ── Channels ─────────────────────────────────────────────────────────

    /// Register the adapter for channel `tag`, replacing any previous one.
    pub fn register_channel(&self, tag: &str, adapter: Arc<dyn ChannelAdapter>) {
        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.to_owned(), adapter);
    }

    /// Whether an adapter is registered for `tag`.
    #[must_use]
    pub fn has_channel(&self, tag: &str) -> bool {
        self.channel(tag).is_some()
    }

    fn channel(&self, tag: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    /// Deliver `text` to `target` through its channel's adapter.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if no adapter is registered for the
    /// channel, otherwise the adapter's error.
    pub async fn deliver(&self, target: &TaskOrigin, text: &str) -> Result<()> {
        let adapter = self.channel(&target.channel).ok_or_else(|| {
            AppError::NotFound(format!("no adapter for channel '{}'", target.channel))
        })?;
        adapter.deliver(target, text).await
    }

    /// Deliver in the background, logging failures.
    pub(crate) fn deliver_detached(&self, target: &TaskOrigin, text: String) {
        let gw = self.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = gw.deliver(&target, &text).await {
                warn!(channel = %target.channel, %err, "channel delivery failed");
            }
        });
    }

    // ── Direct replies ───────────────────────────────────────────────────

    pub(crate) fn register_direct_reply(&self, run_id: &str, target: TaskOrigin) {
        self.direct_replies().insert(run_id.to_owned(), target);
    }

    pub(crate) fn take_direct_reply(&self, run_id: &str) -> Option<TaskOrigin> {
        self.direct_replies().remove(run_id)
    }

    pub(crate) fn clear_direct_reply(&self, run_id: &str) {
        self.direct_replies().remove(run_id);
    }

    /// Number of direct-reply registrations still waiting for a reply.
    #[must_use]
    pub fn pending_direct_replies(&self) -> usize {
        self.direct_replies().len()
    }

    fn direct_replies(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskOrigin>> {
        self.inner
            .direct_replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Status ───────────────────────────────────────────────────────────

    /// Subscribe to worker status changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current status of `worker`.
    #[must_use]
    pub fn status(&self, worker: &Worker) -> WorkerStatus {
        let state = worker.lock();
        WorkerStatus {
            worker_id: worker.id().to_owned(),
            name: worker.name().to_owned(),
            busy: state.current.is_some(),
            offline: state.offline,
            queue_len: state.queue.len(),
            current_task: state.current.as_ref().map(|a| a.task.id.clone()),
            current_session: state
                .current_session
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }

    /// Status of every worker.
    #[must_use]
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.inner.workers.iter().map(|w| self.status(w)).collect()
    }

    pub(crate) fn notify_status(&self, worker: &Worker) {
        // No subscribers is fine.
        let _ = self.inner.status_tx.send(self.status(worker));
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Sessions of `worker_id`, newest first. Cached for the worker's
    /// `session_list_ttl_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown worker, or the index
    /// sync error.
    pub fn list_sessions(&self, worker_id: &str) -> Result<Vec<SessionSummary>> {
        let worker = self.require_worker(worker_id)?;
        let ttl = Duration::from_millis(worker.config().session_list_ttl_ms);
        {
            let state = worker.lock();
            if let Some((at, ref list)) = state.session_list {
                if at.elapsed() < ttl {
                    return Ok(list.clone());
                }
            }
        }

        let store = worker.sessions();
        let index = store.sync_index()?;
        let active = worker.current_session();
        let mut list: Vec<SessionSummary> = index
            .sessions
            .iter()
            .map(|entry| {
                let path = store.absolute(entry);
                SessionSummary {
                    id: entry.id.clone(),
                    label: entry.label.clone(),
                    active: active.as_deref() == Some(path.as_path()),
                    path,
                    created_at: entry.created_at,
                    updated_at: entry.updated_at,
                    size_bytes: entry.size_bytes,
                }
            })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        worker.lock().session_list = Some((Instant::now(), list.clone()));
        Ok(list)
    }

    /// Rename a session of `worker_id` to `label`.
    ///
    /// Conversation bindings follow the file; if it is the worker's current
    /// session the live process is switched to the new path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown worker or session and
    /// [`AppError::PathViolation`] for paths outside the session root.
    pub async fn rename_session(
        &self,
        worker_id: &str,
        session_path: &str,
        label: &str,
    ) -> Result<SessionIndexEntry> {
        let worker = self.require_worker(worker_id)?;
        let renamed = worker.sessions().rename(Path::new(session_path), label)?;

        if renamed.new_path != renamed.old_path {
            let old = renamed.old_path.to_string_lossy().into_owned();
            let new = renamed.new_path.to_string_lossy().into_owned();
            let (map, was_current) = {
                let mut state = worker.lock();
                let mut remapped = false;
                for bound in state.conversation_sessions.entries.values_mut() {
                    if *bound == old {
                        bound.clone_from(&new);
                        remapped = true;
                    }
                }
                let was_current = state.current_session.as_deref() == Some(renamed.old_path.as_path());
                if was_current {
                    state.current_session = Some(renamed.new_path.clone());
                }
                (remapped.then(|| state.conversation_sessions.clone()), was_current)
            };
            if let Some(map) = map {
                worker.persist_conversation_map(&map);
            }
            if was_current {
                if let Err(err) = resolution::switch_to(&worker, &renamed.new_path).await {
                    warn!(worker_id, session_path = %renamed.new_path.display(), %err, "failed to switch worker to renamed session");
                }
            }
        }

        worker.invalidate_session_list();
        info!(worker_id, session_id = %renamed.entry.id, "session renamed");
        Ok(renamed.entry)
    }

    /// Delete a session of `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidRequest`] for the worker's active session,
    /// [`AppError::NotFound`] for unknown workers or sessions and
    /// [`AppError::PathViolation`] for paths outside the session root.
    pub fn delete_session(&self, worker_id: &str, session_path: &str) -> Result<()> {
        let worker = self.require_worker(worker_id)?;
        let active = worker.current_session();
        let removed = worker
            .sessions()
            .delete(Path::new(session_path), active.as_deref())?;

        let removed = removed.to_string_lossy().into_owned();
        let map = {
            let mut state = worker.lock();
            let before = state.conversation_sessions.entries.len();
            state.conversation_sessions.entries.retain(|_, bound| *bound != removed);
            (state.conversation_sessions.entries.len() != before)
                .then(|| state.conversation_sessions.clone())
        };
        if let Some(map) = map {
            worker.persist_conversation_map(&map);
        }

        worker.invalidate_session_list();
        info!(worker_id, session_path = %removed, "session deleted");
        Ok(())
    }
}
