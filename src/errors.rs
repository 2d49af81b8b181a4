//! Error types shared across the gateway.

use std::fmt::{Display, Formatter};

/// Shared gateway result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Gateway error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Malformed line or framing failure on a worker stream.
    Protocol(String),
    /// A correlated request or awaited reply did not arrive in time.
    Timeout(String),
    /// The worker is offline; nothing can be sent to it.
    WorkerOffline(String),
    /// The worker process exited while the call was outstanding.
    WorkerExited(String),
    /// The worker answered a correlated request with `success: false`.
    Rejected(String),
    /// A session path failed validation against the session root.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// Nested spawn would exceed the configured depth limit.
    DepthExceeded(String),
    /// The operation conflicts with the current state (e.g. no active task).
    Conflict(String),
    /// Request was well-formed JSON but semantically invalid.
    InvalidRequest(String),
    /// Session bookkeeping failure (index, map, relocation).
    Session(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::WorkerOffline(msg) => write!(f, "worker offline: {msg}"),
            Self::WorkerExited(msg) => write!(f, "worker exited: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::DepthExceeded(msg) => write!(f, "depth exceeded: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
