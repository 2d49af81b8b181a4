//! Session path validation.
//!
//! Every session path accepted from a caller must resolve strictly inside
//! the worker's session root and carry the session-file suffix. Paths are
//! normalised lexically first (so `..` cannot climb out), then, if the file
//! exists, canonicalised to catch symlink escapes.

use std::path::{Component, Path, PathBuf};

/// Lexically normalise `path`, resolving `.` and `..` without touching the
/// file system. Returns `None` if `..` would climb above the path's root.
#[must_use]
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() || normalized.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                normalized.push(component.as_os_str());
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}

/// Resolve a caller-supplied session path against `root`.
///
/// Relative candidates are joined onto `root`. Returns `None` when the
/// result escapes the root, is the root itself, lacks `suffix`, or is a
/// symlink whose target lies outside the root.
#[must_use]
pub fn resolve_session_file_path(
    root: &Path,
    suffix: &str,
    candidate: impl AsRef<Path>,
) -> Option<PathBuf> {
    let candidate = candidate.as_ref();
    if candidate.as_os_str().is_empty() {
        return None;
    }

    let lexical_root = normalize(root)?;
    let canonical_root = root.canonicalize().unwrap_or_else(|_| lexical_root.clone());

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        canonical_root.join(candidate)
    };
    let normalized = normalize(&joined)?;

    // Accept paths spelled against either form of the root, rebased onto
    // the canonical one.
    let relative = normalized
        .strip_prefix(&canonical_root)
        .or_else(|_| normalized.strip_prefix(&lexical_root))
        .ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    let resolved = canonical_root.join(relative);

    let file_name = resolved.file_name()?.to_str()?;
    if file_name.len() <= suffix.len() || !file_name.ends_with(suffix) {
        return None;
    }

    if resolved.exists() {
        let canonical = resolved.canonicalize().ok()?;
        if !canonical.starts_with(&canonical_root) {
            return None;
        }
    }

    Some(resolved)
}
