//! Session index and per-conversation map file models.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk format version of the session index.
pub const SESSION_INDEX_VERSION: u32 = 1;

/// Current on-disk format version of the conversation map.
pub const SESSION_MAP_VERSION: u32 = 1;

/// Persisted metadata for one session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    /// Identifier derived from the file name; unique within a worker.
    pub id: String,
    /// Human label.
    pub label: String,
    /// Path relative to the worker's session root, `/`-separated.
    pub path: String,
    /// Creation timestamp; preserved across renames.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Per-worker session index file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    /// Format version.
    pub version: u32,
    /// Owning worker id.
    pub agent_id: String,
    /// Last time the index was written.
    pub updated_at: DateTime<Utc>,
    /// Known sessions.
    #[serde(default)]
    pub sessions: Vec<SessionIndexEntry>,
}

impl SessionIndex {
    /// Empty index for `agent_id`.
    #[must_use]
    pub fn empty(agent_id: &str) -> Self {
        Self {
            version: SESSION_INDEX_VERSION,
            agent_id: agent_id.to_owned(),
            updated_at: Utc::now(),
            sessions: Vec::new(),
        }
    }

    /// Find an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SessionIndexEntry> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Insert `entry`, replacing any entry with the same id.
    pub fn upsert(&mut self, entry: SessionIndexEntry) {
        if let Some(existing) = self.sessions.iter_mut().find(|s| s.id == entry.id) {
            *existing = entry;
        } else {
            self.sessions.push(entry);
        }
    }

    /// Remove the entry with `id`; returns it if present.
    pub fn remove(&mut self, id: &str) -> Option<SessionIndexEntry> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(pos))
    }
}

/// Per-worker conversation → session file map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMapFile {
    /// Format version.
    pub version: u32,
    /// Conversation key → absolute session path.
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

impl Default for SessionMapFile {
    fn default() -> Self {
        Self {
            version: SESSION_MAP_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// A freshly allocated session location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSessionPath {
    /// Generated session id.
    pub session_id: String,
    /// Absolute path inside the session root.
    pub session_path: PathBuf,
    /// Default label.
    pub label: String,
    /// Allocation time.
    pub created_at: DateTime<Utc>,
}

/// One row of a worker's rendered session list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Human label.
    pub label: String,
    /// Absolute path of the session file.
    pub path: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// File size in bytes.
    pub size_bytes: u64,
    /// The worker is currently bound to this session.
    pub active: bool,
}
