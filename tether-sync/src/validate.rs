//! Structural check run on a fresh clone before anything touches the target.

use std::path::Path;

use crate::error::SyncError;
use crate::tree;

/// Reject a clone that is empty or that lacks any of `required_files`
/// (top-level, non-empty, regular files).
pub fn validate_tree(root: &Path, required_files: &[String]) -> Result<(), SyncError> {
    let files = tree::list_files(root).map_err(|e| SyncError::Validation(e.to_string()))?;
    if files.is_empty() {
        return Err(SyncError::Validation(
            "fetched tree contains no files".to_string(),
        ));
    }

    for name in required_files {
        if !tree::is_safe_relative(name) {
            return Err(SyncError::Validation(format!(
                "required file {name:?} is not a relative path"
            )));
        }
        let path = root.join(name);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if !meta.is_file() => {
                return Err(SyncError::Validation(format!("{name} is not a regular file")))
            }
            Ok(meta) if meta.len() == 0 => {
                return Err(SyncError::Validation(format!("{name} is empty")))
            }
            Ok(_) => {}
            Err(_) => return Err(SyncError::Validation(format!("{name} is missing"))),
        }
    }
    tracing::debug!("validated {} file(s) in {}", files.len(), root.display());
    Ok(())
}
