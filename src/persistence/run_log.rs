//! Subagent run log.
//!
//! Keeps the most recent runs in memory and mirrors them to a JSON file
//! after every change. Persistence failures are logged, never fatal.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::subagent::{RunStatus, SubagentRun};
use crate::persistence::json_file::{read_json_or_default, write_json_atomic};

/// Runs retained in the log.
pub const MAX_RUNS: usize = 200;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunLogFile {
    #[serde(default)]
    runs: Vec<SubagentRun>,
}

/// File-backed subagent run log.
#[derive(Debug)]
pub struct SubagentRunLog {
    path: Option<PathBuf>,
    runs: Mutex<Vec<SubagentRun>>,
}

impl SubagentRunLog {
    /// Open the log at `path`, loading any runs already recorded.
    ///
    /// Runs still marked `running` belong to a previous process and are
    /// marked failed.
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let mut file: RunLogFile = read_json_or_default(&path);
        for run in &mut file.runs {
            if run.status == RunStatus::Running {
                run.finish(RunStatus::Failed, Some("gateway restarted".into()));
            }
        }
        Self {
            path: Some(path),
            runs: Mutex::new(file.runs),
        }
    }

    /// In-memory log that never touches the disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Insert or replace `run` and persist.
    pub fn record(&self, run: &SubagentRun) {
        let snapshot = {
            let mut runs = self.lock();
            if let Some(existing) = runs.iter_mut().find(|r| r.run_id == run.run_id) {
                *existing = run.clone();
            } else {
                runs.push(run.clone());
                let overflow = runs.len().saturating_sub(MAX_RUNS);
                runs.drain(..overflow);
            }
            runs.clone()
        };
        self.persist(snapshot);
    }

    /// Look up a run by id.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.lock().iter().find(|r| r.run_id == run_id).cloned()
    }

    /// All retained runs, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SubagentRun> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubagentRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, runs: Vec<SubagentRun>) {
        let Some(ref path) = self.path else {
            return;
        };
        if let Err(err) = write_json_atomic(path, &RunLogFile { runs }) {
            warn!(path = %path.display(), %err, "failed to persist subagent run log");
        }
    }
}
