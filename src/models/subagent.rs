//! Subagent run bookkeeping.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::TaskOrigin;
use crate::AppError;

/// How a subagent's reply reaches the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Returned to the parent task.
    Parent,
    /// Delivered straight to the parent task's origin channel.
    Direct,
}

impl FromStr for ReplyMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(Self::Parent),
            "direct" => Ok(Self::Direct),
            other => Err(AppError::InvalidRequest(format!(
                "invalid reply mode '{other}', expected 'parent' or 'direct'"
            ))),
        }
    }
}

/// Lifecycle status of a subagent run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Child task queued or executing.
    Running,
    /// Child task replied.
    Done,
    /// Child task failed or timed out.
    Failed,
}

/// One nested task dispatched on behalf of a parent task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    /// Run identifier.
    pub run_id: String,
    /// Worker running the parent task.
    pub parent_worker_id: String,
    /// Parent task id.
    pub parent_task_id: String,
    /// Worker running the child task.
    pub child_worker_id: String,
    /// Optional caller-supplied label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Effective depth of the child task.
    pub depth: u32,
    /// Current status.
    pub status: RunStatus,
    /// Reply mode the caller asked for.
    pub requested_reply_mode: ReplyMode,
    /// Reply mode actually used after downgrade.
    pub reply_mode: ReplyMode,
    /// Delivery target when `reply_mode` is direct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_target: Option<TaskOrigin>,
    /// Error recorded on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl SubagentRun {
    /// Construct a running record with a generated id.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_worker_id: &str,
        parent_task_id: &str,
        child_worker_id: &str,
        label: Option<String>,
        depth: u32,
        requested_reply_mode: ReplyMode,
        reply_mode: ReplyMode,
        direct_target: Option<TaskOrigin>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            parent_worker_id: parent_worker_id.to_owned(),
            parent_task_id: parent_task_id.to_owned(),
            child_worker_id: child_worker_id.to_owned(),
            label,
            depth,
            status: RunStatus::Running,
            requested_reply_mode,
            reply_mode,
            direct_target,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the run finished with `status`.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.updated_at = Utc::now();
    }
}
