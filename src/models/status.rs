//! Worker status snapshots broadcast to observers.

use serde::Serialize;

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Worker id.
    pub worker_id: String,
    /// Display name.
    pub name: String,
    /// A task is executing.
    pub busy: bool,
    /// The process is down.
    pub offline: bool,
    /// Queued tasks behind the executing one.
    pub queue_len: usize,
    /// Id of the executing task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Session file the worker is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session: Option<String>,
}
