//! Error types for tether-sync.

use std::path::PathBuf;

use thiserror::Error;

use tether_core::ConfigError;

/// All errors that can arise from engine operations.
///
/// Pre-apply failures (`Backup`, `Clone`, `Validation`) leave the target tree
/// untouched; an `Apply` failure may leave it partially overlaid.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Webhook signature did not verify. Never surfaced beyond "unauthorized".
    #[error("signature verification failed")]
    Signature,

    /// The fetch step failed; the target was not touched.
    #[error("clone failed: {0}")]
    Clone(String),

    /// The post-fetch structural check failed; the target was not touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The overlay step failed part-way; the target may hold a mix of versions.
    #[error("apply failed: {0}")]
    Apply(String),

    /// An archive could not be created, listed or extracted.
    #[error("backup error: {0}")]
    Backup(String),

    /// A referenced backup or ledger entry does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Deleting a pinned backup; the caller must unprotect it first.
    #[error("backup {0} is protected; unprotect it before deleting")]
    Protected(String),

    /// A ledger, protection set or tracked-state document could not be read or written.
    #[error("persistence error at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// Another pipeline run (or rollback) holds the single-flight guard.
    #[error("a sync is already in progress")]
    Busy,

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// How bad a failure is for the target tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The target tree is exactly as it was before the run.
    TargetUntouched,
    /// The target tree may be partially updated; inspect or roll back.
    Critical,
    /// Bookkeeping or request-level failure unrelated to the target tree.
    Minor,
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            SyncError::Apply(_) => Severity::Critical,
            SyncError::Backup(_) | SyncError::Clone(_) | SyncError::Validation(_) => {
                Severity::TargetUntouched
            }
            _ => Severity::Minor,
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SyncError::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_error_message_is_tagged() {
        let err = SyncError::Clone("remote: Repository not found".to_string());
        assert!(err.to_string().starts_with("clone failed:"));
        assert_eq!(err.severity(), Severity::TargetUntouched);
    }

    #[test]
    fn apply_is_the_only_critical_failure() {
        assert_eq!(SyncError::Apply("disk full".into()).severity(), Severity::Critical);
        assert_eq!(SyncError::Busy.severity(), Severity::Minor);
        assert_eq!(
            SyncError::not_found("backup", "x").to_string(),
            "backup not found: x"
        );
    }
}
