//! Supervised worker processes.
//!
//! A [`Worker`] is one long-lived agent process plus the routing identity,
//! queue and session state the gateway keeps for it. All mutable state sits
//! behind a single mutex whose guard is never held across an `.await`, so
//! every transition below is atomic with respect to other gateway work.
//!
//! - `launcher`: the process-spawning seam.
//! - `supervisor`: spawn and wire the stream tasks; fire-and-forget sends.
//! - `correlator`: awaitable request/response calls over the line protocol.
//! - `scheduler`: per-worker FIFO queue, task timers, complete/fail.
//! - `resolution`: bind the right session before a prompt is sent.
//! - `events`: react to uncorrelated worker events.
//! - `lifecycle`: exit handling and restart scheduling.

pub mod correlator;
pub mod events;
pub mod launcher;
pub mod lifecycle;
pub mod resolution;
pub mod scheduler;
pub mod supervisor;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::models::session::{SessionMapFile, SessionSummary};
use crate::models::task::{Task, TaskOrigin};
use crate::sessions::SessionStore;
use crate::Result;

pub use launcher::{CommandLauncher, LaunchedProcess, Launcher};

/// Command line and environment used to (re)spawn a worker.
///
/// Computed once when the worker is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Worker binary.
    pub command: String,
    /// Arguments with placeholders already expanded.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    /// Build the spec for `config`, expanding `{session_dir}` and `{worker_id}`.
    #[must_use]
    pub fn from_config(config: &WorkerConfig, session_dir: &Path) -> Self {
        let session_dir = session_dir.to_string_lossy();
        let args = config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{session_dir}", &session_dir)
                    .replace("{worker_id}", &config.id)
            })
            .collect();
        Self {
            command: config.command.clone(),
            args,
            cwd: config.cwd.clone(),
            env: config.env.clone(),
        }
    }
}

/// Live stream plumbing of the current process.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub(crate) tx: mpsc::UnboundedSender<Value>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pid: Option<u32>,
}

/// The executing task plus its per-execution bookkeeping.
#[derive(Debug)]
pub(crate) struct ActiveTask {
    pub(crate) task: Task,
    pub(crate) timeout_timer: Option<JoinHandle<()>>,
    pub(crate) slash_timer: Option<JoinHandle<()>>,
    /// Message count taken just before the prompt; `Some` once the prompt went out.
    pub(crate) snapshot: Option<usize>,
    pub(crate) started_work: bool,
}

impl ActiveTask {
    pub(crate) fn new(task: Task) -> Self {
        Self {
            task,
            timeout_timer: None,
            slash_timer: None,
            snapshot: None,
            started_work: false,
        }
    }

    pub(crate) fn abort_timers(&mut self) {
        if let Some(timer) = self.timeout_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.slash_timer.take() {
            timer.abort();
        }
    }
}

pub(crate) type Resolver = oneshot::Sender<Result<Value>>;

/// Mutable per-worker state.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) current_session: Option<PathBuf>,
    pub(crate) queue: VecDeque<Task>,
    pub(crate) current: Option<ActiveTask>,
    pub(crate) offline: bool,
    pub(crate) pending: HashMap<String, Resolver>,
    pub(crate) restart_timer: Option<JoinHandle<()>>,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) generation: u64,
    /// Prompts still running on the worker whose task already left the
    /// executing state (timed out). Their `agent_end` is swallowed.
    pub(crate) stale_runs: usize,
    pub(crate) session_list: Option<(Instant, Vec<SessionSummary>)>,
    pub(crate) conversation_sessions: SessionMapFile,
}

/// One supervised worker.
#[derive(Debug)]
pub struct Worker {
    id: String,
    config: WorkerConfig,
    spawn_spec: SpawnSpec,
    sessions: SessionStore,
    request_counter: AtomicU64,
    state: Mutex<WorkerState>,
}

/// Snapshot of the task a worker is executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTask {
    /// Task id.
    pub task_id: String,
    /// Nesting depth.
    pub depth: u32,
    /// Submitting channel and conversation.
    pub origin: TaskOrigin,
}

impl Worker {
    /// Create a worker whose sessions live under `session_dir`.
    ///
    /// The worker starts offline; it comes online once spawned.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if the session directory cannot be
    /// created.
    pub fn new(config: WorkerConfig, session_dir: &Path) -> Result<Self> {
        let sessions = SessionStore::open(&config.id, session_dir, &config.session_suffix)?;
        let spawn_spec = SpawnSpec::from_config(&config, sessions.root());
        let conversation_sessions = if config.per_conversation_channels.is_empty() {
            SessionMapFile::default()
        } else {
            sessions.load_conversation_map()
        };

        Ok(Self {
            id: config.id.clone(),
            config,
            spawn_spec,
            sessions,
            request_counter: AtomicU64::new(0),
            state: Mutex::new(WorkerState {
                current_session: None,
                queue: VecDeque::new(),
                current: None,
                offline: true,
                pending: HashMap::new(),
                restart_timer: None,
                process: None,
                generation: 0,
                stale_runs: 0,
                session_list: None,
                conversation_sessions,
            }),
        })
    }

    /// Stable worker id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    /// Configuration block the worker was created from.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Precomputed spawn command.
    #[must_use]
    pub fn spawn_spec(&self) -> &SpawnSpec {
        &self.spawn_spec
    }

    /// Session store of this worker.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.id)
    }

    /// A task is executing.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock().current.is_some()
    }

    /// The process is down; nothing can start or be sent.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.lock().offline
    }

    /// Number of queued (not executing) tasks.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Correlated requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// A restart is scheduled and has not fired yet.
    #[must_use]
    pub fn restart_scheduled(&self) -> bool {
        self.lock().restart_timer.is_some()
    }

    /// Process generation; bumped on every spawn.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Abandoned prompts the worker has not finished yet.
    #[must_use]
    pub fn stale_runs(&self) -> usize {
        self.lock().stale_runs
    }

    /// OS process id of the current child, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.lock().process.as_ref().and_then(|p| p.pid)
    }

    /// Session file the worker is bound to.
    #[must_use]
    pub fn current_session(&self) -> Option<PathBuf> {
        self.lock().current_session.clone()
    }

    /// The executing task, if any.
    #[must_use]
    pub fn current_task(&self) -> Option<CurrentTask> {
        self.lock().current.as_ref().map(|active| CurrentTask {
            task_id: active.task.id.clone(),
            depth: active.task.depth,
            origin: active.task.origin.clone(),
        })
    }

    /// Session bound to a conversation key.
    #[must_use]
    pub fn conversation_session(&self, key: &str) -> Option<PathBuf> {
        self.lock()
            .conversation_sessions
            .entries
            .get(key)
            .map(PathBuf::from)
    }

    /// Whether tasks from `channel` bind sessions per conversation.
    #[must_use]
    pub fn uses_per_conversation(&self, channel: &str) -> bool {
        self.config
            .per_conversation_channels
            .iter()
            .any(|c| c == channel)
    }

    /// Whether this worker may dispatch subagent tasks onto `child_id`.
    #[must_use]
    pub fn may_spawn(&self, child_id: &str) -> bool {
        self.config
            .allowed_subagents
            .iter()
            .any(|allowed| allowed == "*" || allowed == child_id)
    }

    /// Persist the conversation map, logging failures.
    pub(crate) fn persist_conversation_map(&self, map: &SessionMapFile) {
        if let Err(err) = self.sessions.save_conversation_map(map) {
            tracing::warn!(worker_id = %self.id, %err, "failed to persist conversation map");
        }
    }

    pub(crate) fn invalidate_session_list(&self) {
        self.lock().session_list = None;
    }
}
