//! Task model: one unit of prompt work submitted to a worker.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Result;

/// Where a task came from and where its output goes back to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrigin {
    /// Channel tag of the adapter that submitted the task.
    pub channel: String,
    /// Conversation key (chat/thread) when the channel has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
    /// Live UI connection handle when the channel is interactive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_handle: Option<String>,
}

impl TaskOrigin {
    /// Origin on `channel` with no conversation or UI handle.
    #[must_use]
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Whether the origin names a concrete delivery target.
    #[must_use]
    pub fn has_target(&self) -> bool {
        self.conversation_key.is_some() || self.ui_handle.is_some()
    }
}

/// Final output of a task, delivered at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReply {
    /// The worker finished and produced output.
    Completed {
        /// Assistant text produced by this task only.
        text: String,
        /// Attachment-bearing content blocks.
        attachments: Vec<Value>,
        /// The text already went straight to a direct-reply target.
        delivered_directly: bool,
    },
    /// The task was failed; `message` is a short user-facing string.
    Failed {
        /// User-facing failure message.
        message: String,
    },
}

/// Reply callback. `FnOnce` makes a second delivery unrepresentable.
pub type ReplySink = Box<dyn FnOnce(TaskReply) + Send>;

enum ReplySlot {
    Absent,
    Pending(ReplySink),
    Sent,
}

/// Side effect run when the task is promoted to executing, called with the
/// task id and origin. Errors are logged and otherwise ignored.
pub type OnStartHook = Arc<dyn Fn(&str, &TaskOrigin) -> Result<()> + Send + Sync>;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the worker queue.
    Queued,
    /// Currently executing on the worker.
    Executing,
    /// Finished normally.
    Completed,
    /// Failed, timed out, rejected or dropped.
    Failed,
}

impl TaskState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Executing | Self::Failed)
                | (Self::Executing, Self::Completed | Self::Failed)
        )
    }
}

/// One unit of work submitted to a worker.
pub struct Task {
    /// Generated identifier.
    pub id: String,
    /// Submitting channel and conversation.
    pub origin: TaskOrigin,
    /// Prompt text, including any command affordances.
    pub text: String,
    /// Attachment references.
    pub attachments: Vec<String>,
    /// Task is a slash command and may be answered out of band.
    pub slash_command: bool,
    /// Start the task on a brand-new session.
    pub force_new_session: bool,
    /// Nesting depth; 0 for tasks submitted by channels.
    pub depth: u32,
    /// Subagent run this task executes, if any.
    pub subagent_run_id: Option<String>,
    state: TaskState,
    reply: ReplySlot,
    on_start: Option<OnStartHook>,
}

impl Task {
    /// Construct a queued task with a generated id.
    #[must_use]
    pub fn new(origin: TaskOrigin, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin,
            text: text.into(),
            attachments: Vec::new(),
            slash_command: false,
            force_new_session: false,
            depth: 0,
            subagent_run_id: None,
            state: TaskState::Queued,
            reply: ReplySlot::Absent,
            on_start: None,
        }
    }

    /// Attach a reply callback.
    #[must_use]
    pub fn with_reply(mut self, sink: impl FnOnce(TaskReply) + Send + 'static) -> Self {
        self.reply = ReplySlot::Pending(Box::new(sink));
        self
    }

    /// Attach an `on_start` hook.
    #[must_use]
    pub fn with_on_start(mut self, hook: OnStartHook) -> Self {
        self.on_start = Some(hook);
        self
    }

    /// Attach attachment references.
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Mark the task as a slash command.
    #[must_use]
    pub fn slash_command(mut self) -> Self {
        self.slash_command = true;
        self
    }

    /// Request a fresh session for this task.
    #[must_use]
    pub fn fresh_session(mut self) -> Self {
        self.force_new_session = true;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Apply a lifecycle transition; illegal transitions leave the state as is.
    ///
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Whether the task was failed.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.state == TaskState::Failed
    }

    /// Whether a reply has already gone out for this task.
    #[must_use]
    pub fn reply_sent(&self) -> bool {
        matches!(self.reply, ReplySlot::Sent)
    }

    /// Whether the task carries a reply callback that has not fired yet.
    #[must_use]
    pub fn has_reply(&self) -> bool {
        matches!(self.reply, ReplySlot::Pending(_))
    }

    /// Claim the reply: flips `reply_sent` to true exactly once.
    ///
    /// Returns `None` if the reply was already claimed. For a task without
    /// a callback the first claim succeeds with `Some(None)` so callers can
    /// route the output to the origin channel instead.
    pub fn claim_reply(&mut self) -> Option<Option<ReplySink>> {
        match std::mem::replace(&mut self.reply, ReplySlot::Sent) {
            ReplySlot::Sent => None,
            ReplySlot::Absent => Some(None),
            ReplySlot::Pending(sink) => Some(Some(sink)),
        }
    }

    /// The `on_start` hook, if any.
    #[must_use]
    pub fn on_start(&self) -> Option<OnStartHook> {
        self.on_start.clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .field("slash_command", &self.slash_command)
            .field("force_new_session", &self.force_new_session)
            .field("depth", &self.depth)
            .field("subagent_run_id", &self.subagent_run_id)
            .field("reply_sent", &self.reply_sent())
            .finish_non_exhaustive()
    }
}
