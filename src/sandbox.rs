//! Sandbox resolution: turn a client-supplied path into a location under the shared root.

use crate::error::PathEscapeError;
use normpath::PathExt;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Canonical form of the sandbox root (symlinks and junctions resolved).
/// Falls back to the path as given when it cannot be resolved.
pub fn canonical_root(root: &Path) -> PathBuf {
    root.normalize()
        .map(|p| p.into_path_buf())
        .unwrap_or_else(|_| root.to_path_buf())
}

/// Resolve `relative` against `root`, guaranteeing the result is `root` or a
/// descendant of it.
///
/// 1. NUL bytes and drive/UNC prefixes are rejected outright
/// 2. A leading `/` means "the sandbox root", not the host filesystem root
/// 3. `.` and `..` are collapsed lexically; `..` above the root is an escape
/// 4. The longest existing prefix is canonicalized so symlinks and junctions
///    are followed before the containment check
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, PathEscapeError> {
    let parts = collapse(relative)?;
    let root = canonical_root(root);
    let mut joined = root.clone();
    for part in &parts {
        joined.push(part);
    }

    let resolved = follow_links(&joined)?;
    if !resolved.starts_with(&root) {
        return Err(PathEscapeError);
    }
    Ok(resolved)
}

/// Like [`resolve`], but the final component is not followed if it is a link:
/// the parent is resolved and contained, then the last name is appended as-is.
/// Used where the entry itself is the subject (delete), not what it points to.
pub fn resolve_entry(root: &Path, relative: &str) -> Result<PathBuf, PathEscapeError> {
    let mut parts = collapse(relative)?;
    let Some(last) = parts.pop() else {
        return Ok(canonical_root(root));
    };
    let root = canonical_root(root);
    let mut parent = root.clone();
    for part in &parts {
        parent.push(part);
    }
    let parent = follow_links(&parent)?;
    if !parent.starts_with(&root) {
        return Err(PathEscapeError);
    }
    Ok(parent.join(last))
}

/// Lexical pass: reject NUL bytes and prefixes, treat a leading `/` as the
/// sandbox root, collapse `.` and `..`. Popping past the root is an escape.
fn collapse(relative: &str) -> Result<Vec<OsString>, PathEscapeError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if relative.contains('\0') {
        return Err(PathEscapeError);
    }

    let mut parts = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            CurDir => {}
            RootDir => parts.clear(),
            ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathEscapeError);
                }
            }
            Normal(s) => {
                // ADS defense
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(PathEscapeError);
                }
                parts.push(s.to_os_string());
            }
            Prefix(_) => return Err(PathEscapeError),
        }
    }
    Ok(parts)
}

/// Canonicalize the deepest ancestor that exists and re-append the missing tail.
/// A component that exists only as a dangling link is refused: writing through
/// it could create a file anywhere on the host.
fn follow_links(path: &Path) -> Result<PathBuf, PathEscapeError> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if std::fs::symlink_metadata(existing).is_ok() {
            let canon = existing.normalize().map_err(|_| PathEscapeError)?;
            let mut out = canon.into_path_buf();
            for name in tail.iter().rev() {
                out.push(name);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}
