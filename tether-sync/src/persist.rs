//! Atomic JSON documents.
//!
//! Every ledger the engine keeps is a small JSON file written with the
//! `.tmp` sibling + rename pattern, so a crash mid-write leaves the previous
//! version intact. A missing file loads as the document's default.

use std::io::ErrorKind;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;

/// Load `path`, or `T::default()` if it does not exist yet.
pub(crate) fn load_or_default<T>(path: &Path) -> Result<T, SyncError>
where
    T: DeserializeOwned + Default,
{
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(SyncError::persistence(path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&contents).map_err(|e| SyncError::persistence(path, e))
}

/// Save `value` to `path` atomically.
///
/// Writes to `<path>.tmp` then renames to `<path>`.
pub(crate) fn save_atomic<T>(path: &Path, value: &T) -> Result<(), SyncError>
where
    T: Serialize + ?Sized,
{
    let Some(dir) = path.parent() else {
        return Err(SyncError::persistence(path, "path has no parent directory"));
    };
    std::fs::create_dir_all(dir).map_err(|e| SyncError::persistence(dir, e))?;

    let json = serde_json::to_string_pretty(value).map_err(|e| SyncError::persistence(path, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| SyncError::persistence(&tmp, e))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(SyncError::persistence(path, err));
    }
    Ok(())
}
