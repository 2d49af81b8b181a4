//! Worker process launching.
//!
//! The [`Launcher`] trait is the seam between the supervisor and the OS:
//! [`CommandLauncher`] spawns real child processes, tests plug in
//! in-memory workers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::worker::SpawnSpec;
use crate::{AppError, Result};

/// Environment variables inherited by worker processes.
///
/// Everything else from the gateway's environment is stripped with
/// `env_clear()`; per-worker `env` entries are added on top.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the worker id into the child environment.
pub const WORKER_ID_ENV: &str = "GATEWAY_WORKER_ID";

/// A launched worker: its stdio streams and a future resolving on exit.
pub struct LaunchedProcess {
    /// OS process id, when there is a real process.
    pub pid: Option<u32>,
    /// Worker stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves with a human-readable exit reason. Dropping it kills the process.
    pub exit: Pin<Box<dyn Future<Output = String> + Send>>,
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts worker processes.
pub trait Launcher: Send + Sync {
    /// Launch the process described by `spec` for `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the process cannot be started.
    fn launch<'a>(
        &'a self,
        worker_id: &'a str,
        spec: &'a SpawnSpec,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchedProcess>> + Send + 'a>>;
}

/// Launches workers as OS child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch<'a>(
        &'a self,
        worker_id: &'a str,
        spec: &'a SpawnSpec,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchedProcess>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args);

            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
            cmd.envs(&spec.env);
            cmd.env(WORKER_ID_ENV, worker_id);

            cmd.current_dir(&spec.cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Io(format!("failed to spawn worker '{worker_id}': {err}"))
            })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Io("failed to capture worker stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Io("failed to capture worker stdout".into()))?;

            if let Some(stderr) = child.stderr.take() {
                let worker_id = worker_id.to_owned();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(worker_id = %worker_id, line = %line, "worker stderr");
                    }
                });
            }

            let pid = child.id();
            info!(worker_id, ?pid, command = %spec.command, "worker process started");

            let exit_worker = worker_id.to_owned();
            let exit = Box::pin(async move {
                match child.wait().await {
                    Ok(status) => status.code().map_or_else(
                        || "process terminated by signal".to_owned(),
                        |code| format!("process exited with code {code}"),
                    ),
                    Err(err) => {
                        warn!(worker_id = %exit_worker, %err, "error waiting for worker process");
                        format!("wait error: {err}")
                    }
                }
            });

            Ok(LaunchedProcess {
                pid,
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                exit,
            })
        })
    }
}
