//! Global configuration parsing and validation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_http_port() -> u16 {
    7420
}

fn default_session_suffix() -> String {
    ".jsonl".into()
}

fn default_task_timeout_ms() -> u64 {
    600_000
}

fn default_restart_delay_ms() -> i64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_spawn_depth() -> u32 {
    2
}

fn default_session_list_ttl_ms() -> u64 {
    5_000
}

/// Per-worker configuration block (`[[workers]]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Stable worker identifier; also used as a directory name.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Keywords used for text-based routing.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Working directory of the child process.
    pub cwd: PathBuf,
    /// Worker binary.
    pub command: String,
    /// Arguments; `{session_dir}` and `{worker_id}` are expanded at creation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Override for the managed session directory.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// File suffix identifying session transcripts.
    #[serde(default = "default_session_suffix")]
    pub session_suffix: String,
    /// Overall task timeout; 0 disables it.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Shorter timeout for slash-command tasks; 0 disables it.
    #[serde(default)]
    pub slash_command_timeout_ms: u64,
    /// Delay before respawning an exited worker; negative disables restart.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: i64,
    /// Timeout for correlated control requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Maximum nesting depth for subagent spawns.
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: u32,
    /// Worker ids this worker may spawn onto; `*` allows all.
    #[serde(default)]
    pub allowed_subagents: Vec<String>,
    /// Channel tags that bind sessions per conversation.
    #[serde(default)]
    pub per_conversation_channels: Vec<String>,
    /// Lifetime of the cached session list.
    #[serde(default = "default_session_list_ttl_ms")]
    pub session_list_ttl_ms: u64,
}

impl WorkerConfig {
    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Overall task timeout, `None` when disabled.
    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_ms > 0).then(|| Duration::from_millis(self.task_timeout_ms))
    }

    /// Slash-command timeout, `None` when disabled.
    #[must_use]
    pub fn slash_command_timeout(&self) -> Option<Duration> {
        (self.slash_command_timeout_ms > 0)
            .then(|| Duration::from_millis(self.slash_command_timeout_ms))
    }

    /// Restart delay, `None` when auto-restart is disabled.
    #[must_use]
    pub fn restart_delay(&self) -> Option<Duration> {
        u64::try_from(self.restart_delay_ms)
            .ok()
            .map(Duration::from_millis)
    }

    /// Timeout applied to correlated requests.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Global configuration parsed from `gateway.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for session directories, index/map files and the run log.
    pub data_dir: PathBuf,
    /// HTTP port for the control API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Worker used when routing finds no keyword match.
    #[serde(default)]
    pub default_worker: Option<String>,
    /// Supervised workers.
    pub workers: Vec<WorkerConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a worker block by id.
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Managed session directory for a worker.
    #[must_use]
    pub fn session_dir(&self, worker: &WorkerConfig) -> PathBuf {
        worker
            .session_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sessions").join(&worker.id))
    }

    /// Path of the subagent run log.
    #[must_use]
    pub fn subagent_log_path(&self) -> PathBuf {
        self.data_dir.join("subagent-runs.json")
    }

    fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(AppError::Config("at least one worker must be configured".into()));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.is_empty() || !is_safe_id(&worker.id) {
                return Err(AppError::Config(format!(
                    "worker id '{}' must be non-empty and use only [A-Za-z0-9_-]",
                    worker.id
                )));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(AppError::Config(format!("duplicate worker id '{}'", worker.id)));
            }
            if worker.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "worker '{}' has an empty command",
                    worker.id
                )));
            }
            if !worker.session_suffix.starts_with('.') {
                return Err(AppError::Config(format!(
                    "worker '{}' session_suffix must start with '.'",
                    worker.id
                )));
            }
        }

        if let Some(ref default) = self.default_worker {
            if self.worker(default).is_none() {
                return Err(AppError::Config(format!(
                    "default_worker '{default}' is not a configured worker"
                )));
            }
        }

        Ok(())
    }
}

fn is_safe_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
