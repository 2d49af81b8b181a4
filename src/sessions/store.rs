//! Per-worker session index and conversation map.
//!
//! The index (`index.json`) and conversation map (`conversation-map.json`)
//! live in the worker's session root next to the session files. Both are
//! read-modify-written whole with atomic replacement; the gateway is the
//! only writer. Index updates are serialised per store because they run
//! on several runtime threads at once (HTTP listing, session resolution).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::session::{NewSessionPath, SessionIndex, SessionIndexEntry, SessionMapFile};
use crate::persistence::json_file::{read_json, read_json_or_default, write_json_atomic};
use crate::sessions::path_safety::resolve_session_file_path;
use crate::sessions::relocate::{relocate, RelocateOutcome};
use crate::{AppError, Result};

/// Maximum length of a session id derived from a label.
pub const MAX_SESSION_ID_LEN: usize = 64;

const INDEX_FILE: &str = "index.json";
const MAP_FILE: &str = "conversation-map.json";

/// Outcome of [`SessionStore::rename`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedSession {
    /// Absolute path before the rename.
    pub old_path: PathBuf,
    /// Absolute path after the rename; equal to `old_path` if unchanged.
    pub new_path: PathBuf,
    /// Updated index entry.
    pub entry: SessionIndexEntry,
}

/// Session files, index and conversation map for one worker.
#[derive(Debug, Clone)]
pub struct SessionStore {
    worker_id: String,
    root: PathBuf,
    index_path: PathBuf,
    map_path: PathBuf,
    suffix: String,
    index_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the root cannot be created or resolved.
    pub fn open(worker_id: &str, root: &Path, suffix: &str) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|err| AppError::Io(format!("failed to create {}: {err}", root.display())))?;
        let root = root
            .canonicalize()
            .map_err(|err| AppError::Io(format!("failed to resolve {}: {err}", root.display())))?;
        Ok(Self {
            worker_id: worker_id.to_owned(),
            index_path: root.join(INDEX_FILE),
            map_path: root.join(MAP_FILE),
            root,
            suffix: suffix.to_owned(),
            index_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Canonical session root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session file suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Validate a caller-supplied session path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::PathViolation`] if the path escapes the session
    /// root or lacks the session suffix.
    pub fn resolve(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let candidate = candidate.as_ref();
        resolve_session_file_path(&self.root, &self.suffix, candidate).ok_or_else(|| {
            AppError::PathViolation(format!(
                "{} is not a session file under {}",
                candidate.display(),
                self.root.display()
            ))
        })
    }

    /// Absolute path of an index entry.
    #[must_use]
    pub fn absolute(&self, entry: &SessionIndexEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    // ── Index ────────────────────────────────────────────────────────────

    /// Load the index, starting empty when missing or unreadable.
    #[must_use]
    pub fn load_index(&self) -> SessionIndex {
        match read_json::<SessionIndex>(&self.index_path) {
            Ok(Some(index)) => index,
            Ok(None) => SessionIndex::empty(&self.worker_id),
            Err(err) => {
                warn!(worker_id = %self.worker_id, %err, "session index unreadable, rebuilding");
                SessionIndex::empty(&self.worker_id)
            }
        }
    }

    /// Stamp and persist `index`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be written.
    pub fn write_index(&self, index: &mut SessionIndex) -> Result<()> {
        index.agent_id.clone_from(&self.worker_id);
        index.updated_at = Utc::now();
        write_json_atomic(&self.index_path, index)
    }

    /// Reconcile the index with the session files on disk.
    ///
    /// New files are added and size/timestamps refreshed. Entries whose file
    /// vanished are kept; removal only happens through [`Self::delete`].
    /// The index is rewritten only when something changed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] if the directory cannot be walked and
    /// [`AppError::Io`] if the index cannot be written.
    pub fn sync_index(&self) -> Result<SessionIndex> {
        let _guard = self.lock_index();
        let mut index = self.load_index();
        let mut changed = false;
        let mut seen = HashSet::new();

        for path in self.session_files()? {
            let Some(id) = self.id_for(&path) else {
                continue;
            };
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let rel = self.relative(&path);
            let size = meta.len();
            let modified = meta.modified().map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

            if !seen.insert(id.clone()) {
                warn!(worker_id = %self.worker_id, session_id = %id, path = %rel, "duplicate session id on disk, skipping");
                continue;
            }

            match index.sessions.iter_mut().find(|s| s.id == id) {
                Some(entry) => {
                    if entry.path != rel {
                        if self.root.join(&entry.path).exists() {
                            warn!(worker_id = %self.worker_id, session_id = %id, path = %rel, "session id already indexed at another path, skipping");
                            continue;
                        }
                        entry.path = rel;
                        changed = true;
                    }
                    if entry.size_bytes != size || entry.updated_at != modified {
                        entry.size_bytes = size;
                        entry.updated_at = modified;
                        changed = true;
                    }
                }
                None => {
                    let created_at = meta.created().map_or(modified, DateTime::<Utc>::from);
                    debug!(worker_id = %self.worker_id, session_id = %id, "indexing discovered session");
                    index.sessions.push(SessionIndexEntry {
                        label: id.clone(),
                        id,
                        path: rel,
                        created_at,
                        updated_at: modified,
                        size_bytes: size,
                    });
                    changed = true;
                }
            }
        }

        if changed {
            self.write_index(&mut index)?;
        }
        Ok(index)
    }

    /// Allocate a fresh, collision-resistant session path.
    #[must_use]
    pub fn create_path(&self, now: DateTime<Utc>) -> NewSessionPath {
        let random = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &random[..8]);
        NewSessionPath {
            session_path: self.root.join(format!("{session_id}{}", self.suffix)),
            label: now.format("Session %Y-%m-%d %H:%M").to_string(),
            session_id,
            created_at: now,
        }
    }

    /// Register or refresh the index entry for `path`.
    ///
    /// An existing label and creation time are kept unless `label` is given.
    /// The file may not exist yet, in which case it is recorded as empty.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::PathViolation`] for paths outside the root and
    /// [`AppError::Io`] if the index cannot be written.
    pub fn upsert(&self, path: &Path, label: Option<&str>) -> Result<SessionIndexEntry> {
        let resolved = self.resolve(path)?;
        let id = self
            .id_for(&resolved)
            .ok_or_else(|| AppError::PathViolation(format!("{} has no session id", resolved.display())))?;

        let _guard = self.lock_index();
        let mut index = self.load_index();
        let now = Utc::now();
        let (size, modified) = file_stats(&resolved, now);
        let previous = index.get(&id).cloned();

        let entry = SessionIndexEntry {
            label: label
                .map(str::to_owned)
                .or_else(|| previous.as_ref().map(|p| p.label.clone()))
                .unwrap_or_else(|| id.clone()),
            path: self.relative(&resolved),
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: modified,
            size_bytes: size,
            id,
        };
        index.upsert(entry.clone());
        self.write_index(&mut index)?;
        Ok(entry)
    }

    /// Rename the session at `path` to a slug of `label`.
    ///
    /// The file is moved within its directory when the slug differs from
    /// its current id; clashes get `-2`, `-3`, ... suffixes.
    ///
    /// # Errors
    ///
    /// - [`AppError::PathViolation`] for paths outside the root.
    /// - [`AppError::NotFound`] if the session file does not exist.
    /// - [`AppError::Session`] if the file cannot be moved.
    pub fn rename(&self, path: &Path, label: &str) -> Result<RenamedSession> {
        let old_path = self.resolve(path)?;
        if !old_path.is_file() {
            return Err(AppError::NotFound(format!("session {} not found", old_path.display())));
        }
        let old_id = self
            .id_for(&old_path)
            .ok_or_else(|| AppError::PathViolation(format!("{} has no session id", old_path.display())))?;
        let dir = old_path.parent().unwrap_or(&self.root).to_path_buf();

        let _guard = self.lock_index();
        let mut index = self.load_index();
        let base = slugify(label);
        let mut candidate = base.clone();
        let mut counter = 2_u32;
        while candidate != old_id
            && (dir.join(format!("{candidate}{}", self.suffix)).exists()
                || index.get(&candidate).is_some())
        {
            candidate = with_counter(&base, counter);
            counter += 1;
        }

        let new_path = dir.join(format!("{candidate}{}", self.suffix));
        match relocate(&old_path, &new_path) {
            RelocateOutcome::Moved { .. } | RelocateOutcome::Unchanged => {}
            RelocateOutcome::Missing => {
                return Err(AppError::NotFound(format!("session {} not found", old_path.display())));
            }
            RelocateOutcome::Failed(err) => {
                return Err(AppError::Session(format!("failed to rename session: {err}")));
            }
        }

        let now = Utc::now();
        let previous = index.remove(&old_id);
        let (size, modified) = file_stats(&new_path, now);
        let entry = SessionIndexEntry {
            id: candidate,
            label: label.trim().to_owned(),
            path: self.relative(&new_path),
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: modified,
            size_bytes: size,
        };
        index.upsert(entry.clone());
        self.write_index(&mut index)?;

        Ok(RenamedSession {
            old_path,
            new_path,
            entry,
        })
    }

    /// Delete the session at `path` and its index entry.
    ///
    /// # Errors
    ///
    /// - [`AppError::PathViolation`] for paths outside the root.
    /// - [`AppError::InvalidRequest`] if `path` is the active session.
    /// - [`AppError::NotFound`] if neither file nor index entry exist.
    /// - [`AppError::Io`] if the file cannot be removed.
    pub fn delete(&self, path: &Path, active: Option<&Path>) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        if active.is_some_and(|a| a == resolved) {
            return Err(AppError::InvalidRequest(
                "cannot delete the active session".into(),
            ));
        }

        let _guard = self.lock_index();
        let mut index = self.load_index();
        let removed = self.id_for(&resolved).and_then(|id| index.remove(&id));

        match fs::remove_file(&resolved) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if removed.is_none() {
                    return Err(AppError::NotFound(format!(
                        "session {} not found",
                        resolved.display()
                    )));
                }
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to delete {}: {err}",
                    resolved.display()
                )));
            }
        }

        if removed.is_some() {
            self.write_index(&mut index)?;
        }
        Ok(resolved)
    }

    // ── Conversation map ─────────────────────────────────────────────────

    /// Load the conversation map, starting empty when missing or unreadable.
    #[must_use]
    pub fn load_conversation_map(&self) -> SessionMapFile {
        read_json_or_default(&self.map_path)
    }

    /// Persist the conversation map.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be written.
    pub fn save_conversation_map(&self, map: &SessionMapFile) -> Result<()> {
        write_json_atomic(&self.map_path, map)
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn lock_index(&self) -> MutexGuard<'_, ()> {
        self.index_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_files(&self) -> Result<Vec<PathBuf>> {
        let root = self
            .root
            .to_str()
            .ok_or_else(|| AppError::Session("session root is not valid UTF-8".into()))?;
        let pattern = format!(
            "{}/**/*{}",
            glob::Pattern::escape(root),
            glob::Pattern::escape(&self.suffix)
        );
        let entries = glob::glob(&pattern)
            .map_err(|err| AppError::Session(format!("invalid session glob: {err}")))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .filter(|p| p.is_file() && *p != self.index_path && *p != self.map_path)
            .collect();
        files.sort();
        Ok(files)
    }

    fn id_for(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let id = name.strip_suffix(self.suffix.as_str())?;
        (!id.is_empty()).then(|| id.to_owned())
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn file_stats(path: &Path, now: DateTime<Utc>) -> (u64, DateTime<Utc>) {
    fs::metadata(path).map_or((0, now), |meta| {
        (
            meta.len(),
            meta.modified().map_or(now, DateTime::<Utc>::from),
        )
    })
}

/// Derive a filesystem-safe session id from a label.
///
/// Lowercases, replaces runs of non-alphanumeric characters with `-`,
/// trims dashes and caps the result at [`MAX_SESSION_ID_LEN`].
#[must_use]
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = truncate(slug.trim_matches('-'), MAX_SESSION_ID_LEN);
    if slug.is_empty() {
        "session".to_owned()
    } else {
        slug
    }
}

/// `base` with a `-n` collision suffix, still within [`MAX_SESSION_ID_LEN`].
#[must_use]
pub fn with_counter(base: &str, n: u32) -> String {
    let suffix = format!("-{n}");
    let keep = MAX_SESSION_ID_LEN.saturating_sub(suffix.len());
    format!("{}{suffix}", truncate(base, keep))
}

fn truncate(s: &str, max: usize) -> String {
    // Slugs are ASCII, so byte and char offsets agree.
    s.chars()
        .take(max)
        .collect::<String>()
        .trim_end_matches('-')
        .to_owned()
}
