//! Typed worker line protocol.
//!
//! Outbound control messages are [`WorkerCommand`]s serialised with a
//! `type` tag; correlated calls get an `id` attached by the correlator.
//! Inbound lines decode to [`InboundLine`]: either a correlated
//! [`ResponseLine`] or an uncorrelated [`WorkerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{AppError, Result};

/// Outbound control message (gateway → worker).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Send a user prompt.
    Prompt {
        /// Prompt text.
        message: String,
        /// Attachment references passed through to the worker.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<String>,
    },
    /// Query the worker's current state (session file, message count).
    GetState,
    /// Fetch the full message list of the current session.
    GetMessages,
    /// Start a fresh session.
    NewSession,
    /// Switch the worker onto an existing session file.
    SwitchSession {
        /// Absolute path of the session file.
        #[serde(rename = "sessionPath")]
        session_path: String,
    },
    /// Answer an extension UI request.
    ExtensionUiResponse {
        /// Id of the request being answered.
        id: String,
        /// Whether the dialog was dismissed.
        cancelled: bool,
    },
    /// Result of a worker-initiated subagent spawn.
    SubagentResult {
        /// Id of the originating `subagent_request`.
        id: String,
        /// Whether the spawn succeeded.
        success: bool,
        /// Spawn payload on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Error text on failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkerCommand {
    /// Wire name of the command (the `type` tag).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::GetState => "get_state",
            Self::GetMessages => "get_messages",
            Self::NewSession => "new_session",
            Self::SwitchSession { .. } => "switch_session",
            Self::ExtensionUiResponse { .. } => "extension_ui_response",
            Self::SubagentResult { .. } => "subagent_result",
        }
    }

    /// Serialise to a JSON object, optionally tagging it with a correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if serialisation fails.
    pub fn to_value(&self, id: Option<&str>) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let (Some(id), Value::Object(map)) = (id, &mut value) {
            map.insert("id".into(), Value::String(id.to_owned()));
        }
        Ok(value)
    }
}

/// Correlated response (`{type:"response", id, command, success, data|error}`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResponseLine {
    /// Correlation id echoed from the request.
    #[serde(default)]
    pub id: Option<String>,
    /// Command the response belongs to.
    #[serde(default)]
    pub command: Option<String>,
    /// Whether the command succeeded.
    #[serde(default)]
    pub success: bool,
    /// Success payload.
    #[serde(default)]
    pub data: Option<Value>,
    /// Error text.
    #[serde(default)]
    pub error: Option<String>,
}

/// Worker-initiated request to run a nested task on another worker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRequest {
    /// Request id, echoed in the `subagent_result` answer.
    pub id: String,
    /// Target worker id.
    pub agent_id: String,
    /// Task text for the child worker.
    pub task: String,
    /// Optional label for the run.
    #[serde(default)]
    pub label: Option<String>,
    /// Reply wait limit in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// `parent` or `direct`.
    #[serde(default)]
    pub reply_mode: Option<String>,
    /// Legacy boolean equivalent of `reply_mode = "direct"`.
    #[serde(default)]
    pub direct_reply: Option<bool>,
}

/// Uncorrelated event emitted by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker began processing a prompt.
    AgentStart,
    /// The worker finished processing a prompt.
    AgentEnd {
        /// Messages produced during the run, if the worker includes them.
        messages: Vec<Value>,
    },
    /// A message started streaming.
    MessageStart,
    /// Incremental update of a streaming message.
    MessageUpdate,
    /// A message finished streaming.
    MessageEnd {
        /// The finished message.
        message: Value,
    },
    /// The worker asks the front-end for user interaction.
    ExtensionUiRequest {
        /// Request id to answer with.
        id: String,
        /// `notify`, `select`, `confirm`, `input`, ...
        method: String,
        /// Body text.
        message: Option<String>,
        /// Dialog title.
        title: Option<String>,
    },
    /// The worker asks the gateway to spawn a subagent.
    SubagentRequest(SubagentRequest),
    /// Any event type the gateway does not handle.
    Unknown {
        /// The `type` value as received.
        kind: String,
    },
}

impl WorkerEvent {
    /// Whether this event shows the worker began substantive work.
    #[must_use]
    pub fn signals_work(&self) -> bool {
        matches!(
            self,
            Self::AgentStart | Self::MessageStart | Self::MessageUpdate
        )
    }
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// Correlated response.
    Response(ResponseLine),
    /// Uncorrelated event.
    Event(WorkerEvent),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct UiRequestFields {
    id: String,
    method: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Parse a single line from a worker's stdout.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")`: not a JSON object with a `type`.
/// - [`AppError::Protocol`]`("missing required field: …")`: known type, bad payload.
pub fn parse_inbound_line(worker_id: &str, line: &str) -> Result<Option<InboundLine>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;
    let rest = Value::Object(envelope.rest);

    let parsed = match envelope.kind.as_str() {
        "response" => InboundLine::Response(field_error("response", serde_json::from_value(rest))?),
        "agent_start" => InboundLine::Event(WorkerEvent::AgentStart),
        "agent_end" => {
            let messages = rest
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            InboundLine::Event(WorkerEvent::AgentEnd { messages })
        }
        "message_start" => InboundLine::Event(WorkerEvent::MessageStart),
        "message_update" => InboundLine::Event(WorkerEvent::MessageUpdate),
        "message_end" => InboundLine::Event(WorkerEvent::MessageEnd {
            message: rest.get("message").cloned().unwrap_or(Value::Null),
        }),
        "extension_ui_request" => {
            let fields: UiRequestFields =
                field_error("extension_ui_request", serde_json::from_value(rest))?;
            InboundLine::Event(WorkerEvent::ExtensionUiRequest {
                id: fields.id,
                method: fields.method,
                message: fields.message,
                title: fields.title,
            })
        }
        "subagent_request" => InboundLine::Event(WorkerEvent::SubagentRequest(field_error(
            "subagent_request",
            serde_json::from_value(rest),
        )?)),
        other => {
            debug!(worker_id, kind = other, "unhandled worker event type");
            InboundLine::Event(WorkerEvent::Unknown {
                kind: other.to_owned(),
            })
        }
    };

    Ok(Some(parsed))
}

fn field_error<T>(kind: &str, result: serde_json::Result<T>) -> Result<T> {
    result.map_err(|e| AppError::Protocol(format!("missing required field: {kind}: {e}")))
}

/// Assistant output isolated from a message list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantOutput {
    /// Concatenated assistant text, paragraphs separated by blank lines.
    pub text: String,
    /// Attachment-bearing content blocks (`image`, `file`).
    pub attachments: Vec<Value>,
}

/// Extract assistant text and attachment blocks from `messages`.
///
/// Only messages with `role == "assistant"` contribute. Content may be a
/// plain string or an array of typed blocks.
#[must_use]
pub fn extract_assistant_output(messages: &[Value]) -> AssistantOutput {
    let mut parts: Vec<String> = Vec::new();
    let mut attachments = Vec::new();

    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        match message.get("content") {
            Some(Value::String(text)) => push_text(&mut parts, text),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                push_text(&mut parts, text);
                            }
                        }
                        Some("image" | "file") => attachments.push(block.clone()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    AssistantOutput {
        text: parts.join("\n\n"),
        attachments,
    }
}

fn push_text(parts: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_owned());
    }
}
