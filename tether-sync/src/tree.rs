//! Directory-tree primitives shared by the apply modes.
//!
//! ## `copy_file` — hash-gated atomic copy
//!
//! 1. SHA-256 the source file.
//! 2. SHA-256 the existing target file (if any) → skip if identical.
//! 3. Copy to `<target>.tether.tmp`.
//! 4. Rename to the final path (atomic on POSIX).
//!
//! A single file is therefore never observed half-written, even when the
//! tree as a whole is mid-overlay.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{io_err, SyncError};

/// Version-control metadata that never leaves the clone.
pub const VCS_METADATA: &[&str] = &[".git"];

/// Counts reported by every apply mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    /// Files written because content differed or was absent.
    pub copied: usize,
    /// Files whose target content already matched the source.
    pub unchanged: usize,
    /// Files whose copy failed and were left as they were.
    pub skipped: usize,
    /// Files removed from the target.
    pub deleted: usize,
    /// Deletions that failed and were left in place.
    pub delete_failed: usize,
}

/// Result of copying one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    Unchanged,
}

/// Enumerate every regular file under `root` as a `/`-separated relative
/// path, skipping version-control metadata. Symlinks are not followed.
pub fn list_files(root: &Path) -> Result<BTreeSet<String>, SyncError> {
    let mut files = BTreeSet::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_vcs_metadata(entry.file_name()));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            io_err(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if let Some(key) = relative_key(relative) {
            files.insert(key);
        }
    }
    Ok(files)
}

/// Remove version-control metadata from the top of a fresh clone.
pub fn strip_vcs_metadata(root: &Path) -> Result<(), SyncError> {
    for name in VCS_METADATA {
        let path = root.join(name);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                std::fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?
            }
            Ok(_) => std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path, err)),
        }
    }
    Ok(())
}

/// Delete a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Delete one file; a missing file is not an error. Returns whether a file
/// was actually removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, SyncError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Copy `relative` from `source_root` to `target_root` with the hash-gated
/// atomic protocol described in the module docs.
pub fn copy_file(
    source_root: &Path,
    target_root: &Path,
    relative: &str,
) -> Result<CopyOutcome, SyncError> {
    let src = source_root.join(relative);
    let dst = target_root.join(relative);
    let tmp = PathBuf::from(format!("{}.tether.tmp", dst.display()));
    copy_file_with_tmp(&src, &dst, &tmp)
}

fn copy_file_with_tmp(src: &Path, dst: &Path, tmp: &Path) -> Result<CopyOutcome, SyncError> {
    let source_digest = sha256_file(src)?;
    match sha256_file(dst) {
        Ok(existing) if existing == source_digest => {
            tracing::debug!("unchanged: {}", dst.display());
            return Ok(CopyOutcome::Unchanged);
        }
        Ok(_) => {}
        Err(SyncError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::copy(src, tmp).map_err(|e| io_err(tmp, e))?;
    if let Err(e) = std::fs::rename(tmp, dst) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(dst, e));
    }
    tracing::debug!("wrote: {}", dst.display());
    Ok(CopyOutcome::Copied)
}

/// Overlay every file of `source_root` onto `target_root`.
///
/// Existing target files not present in the source are left alone. The
/// first copy failure aborts with [`SyncError::Apply`]; files copied before
/// it stay copied.
pub fn overlay(
    source_root: &Path,
    target_root: &Path,
    files: &BTreeSet<String>,
) -> Result<ApplySummary, SyncError> {
    let mut summary = ApplySummary::default();
    for relative in files {
        match copy_file(source_root, target_root, relative) {
            Ok(CopyOutcome::Copied) => summary.copied += 1,
            Ok(CopyOutcome::Unchanged) => summary.unchanged += 1,
            Err(err) => {
                return Err(SyncError::Apply(format!(
                    "{relative}: {err} ({} file(s) already copied)",
                    summary.copied
                )))
            }
        }
    }
    Ok(summary)
}

/// Destructive full mirror: overlay, then delete every target file that is
/// neither in `files` nor covered by `excludes`, then prune emptied
/// directories. Excluded paths are never descended into or removed.
pub fn mirror(
    source_root: &Path,
    target_root: &Path,
    files: &BTreeSet<String>,
    excludes: &[String],
) -> Result<ApplySummary, SyncError> {
    let mut summary = overlay(source_root, target_root, files)?;

    let existing = list_files(target_root).map_err(|e| SyncError::Apply(e.to_string()))?;
    for relative in existing.difference(files) {
        if is_excluded(relative, excludes) {
            continue;
        }
        let path = target_root.join(relative);
        match remove_file_if_exists(&path) {
            Ok(true) => {
                summary.deleted += 1;
                tracing::info!("mirror removed: {}", path.display());
            }
            Ok(false) => {}
            Err(err) => {
                summary.delete_failed += 1;
                tracing::warn!("mirror could not remove {}: {err}", path.display());
            }
        }
    }
    prune_empty_dirs(target_root, excludes);
    Ok(summary)
}

/// Remove now-empty directories below `root` (never `root` itself).
fn prune_empty_dirs(root: &Path, excludes: &[String]) {
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        let relative = dir.strip_prefix(root).ok().and_then(relative_key);
        if relative.map(|r| is_excluded(&r, excludes)).unwrap_or(true) {
            continue;
        }
        // remove_dir only succeeds on empty directories.
        let _ = std::fs::remove_dir(&dir);
    }
}

/// `true` when `relative` equals an exclude entry or lies beneath one.
pub fn is_excluded(relative: &str, excludes: &[String]) -> bool {
    excludes.iter().any(|raw| {
        let pattern = raw.trim_matches('/');
        !pattern.is_empty()
            && (relative == pattern
                || relative
                    .strip_prefix(pattern)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

/// A relative path is safe to join onto a target root: non-empty, not
/// absolute, and free of `..` components.
pub fn is_safe_relative(relative: &str) -> bool {
    let path = Path::new(relative);
    !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// SHA-256 hex digest of a file's bytes.
pub fn sha256_file(path: &Path) -> Result<String, SyncError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_vcs_metadata(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| VCS_METADATA.contains(&n))
}

fn relative_key(relative: &Path) -> Option<String> {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
