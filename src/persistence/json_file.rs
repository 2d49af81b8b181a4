//! Atomic JSON file persistence.
//!
//! Index, conversation-map and run-log files are rewritten whole: the new
//! content goes to a temporary file in the same directory which is then
//! renamed over the target, so readers never observe a partial write.
//! There is a single writer per file (this process); last writer wins.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::{AppError, Result};

/// Read `path` as JSON, returning `None` when the file does not exist.
///
/// # Errors
///
/// Returns [`AppError::Io`] on read failures other than "not found" and
/// [`AppError::Session`] when the content is not valid JSON for `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to read {}: {err}",
                path.display()
            )))
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| AppError::Session(format!("corrupt json in {}: {err}", path.display())))
}

/// Read `path` as JSON, falling back to `T::default()` when missing or corrupt.
///
/// Corrupt files are logged and treated as empty.
#[must_use]
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable json file, starting empty");
            T::default()
        }
    }
}

/// Serialise `value` as pretty JSON and atomically replace `path`.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the directory cannot be created or the
/// temporary file cannot be written or persisted.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!("failed to create {}: {err}", parent.display()))
    })?;

    let bytes = serde_json::to_vec_pretty(value)?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(&bytes)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("failed to persist {}: {err}", path.display())))?;

    Ok(())
}
