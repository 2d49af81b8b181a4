//! Session file relocation.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Result of [`relocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateOutcome {
    /// The file now lives at the destination.
    Moved {
        /// Rename failed and the copy-then-delete fallback was used.
        via_copy: bool,
    },
    /// Source and destination are the same path; nothing to do.
    Unchanged,
    /// The source file does not exist.
    Missing,
    /// Relocation failed; the source is left in place.
    Failed(String),
}

impl RelocateOutcome {
    /// Whether the file is available at the destination afterwards.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Unchanged)
    }
}

/// Move `from` to `to`, creating the destination directory.
///
/// An atomic rename is tried first; if it fails (typically across devices)
/// the file is copied and the source removed.
#[must_use]
pub fn relocate(from: &Path, to: &Path) -> RelocateOutcome {
    if from == to {
        return RelocateOutcome::Unchanged;
    }
    if !from.exists() {
        return RelocateOutcome::Missing;
    }
    if let Some(parent) = to.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            return RelocateOutcome::Failed(format!(
                "failed to create {}: {err}",
                parent.display()
            ));
        }
    }

    match fs::rename(from, to) {
        Ok(()) => RelocateOutcome::Moved { via_copy: false },
        Err(err) => {
            debug!(from = %from.display(), to = %to.display(), %err, "rename failed, copying");
            match copy_fallback(from, to) {
                Ok(()) => RelocateOutcome::Moved { via_copy: true },
                Err(err) => RelocateOutcome::Failed(err.to_string()),
            }
        }
    }
}

/// Copy `from` to `to`, then delete `from`.
///
/// If the source cannot be removed the copy is rolled back so exactly one
/// file remains.
///
/// # Errors
///
/// Returns the underlying I/O error of the copy or the removal.
pub fn copy_fallback(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    if let Err(err) = fs::remove_file(from) {
        if let Err(rollback) = fs::remove_file(to) {
            warn!(path = %to.display(), %rollback, "failed to roll back copied session file");
        }
        return Err(err);
    }
    Ok(())
}
