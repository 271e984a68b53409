//! Tracked file sync — overlay plus removal of files this tool put there.
//!
//! Persists a `TrackedState` JSON document at
//! `<state_dir>/tracked-files.json`: every path copied by the last sync and
//! the SHA-256 it had. A later sync deletes from the target exactly the
//! previously-tracked paths that vanished from the source, so files the
//! tool never wrote are never touched.
//!
//! Older deployments stored a bare list of paths; that form still loads.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::persist;
use crate::tree::{self, ApplySummary, CopyOutcome};

/// Relative path → SHA-256 hex digest of what was copied.
pub type TrackedFiles = BTreeMap<String, String>;

/// On-disk tracked state payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedState {
    pub synced_at: DateTime<Utc>,
    pub files: TrackedFiles,
}

impl Default for TrackedState {
    fn default() -> Self {
        TrackedState {
            synced_at: Utc::now(),
            files: TrackedFiles::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackedStateCompat {
    Legacy(Vec<String>),
    Structured(TrackedStateStructuredCompat),
}

impl Default for TrackedStateCompat {
    fn default() -> Self {
        TrackedStateCompat::Legacy(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct TrackedStateStructuredCompat {
    synced_at: Option<DateTime<Utc>>,
    files: TrackedFiles,
}

/// What a sync would do, without doing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackedPlan {
    pub copy: BTreeSet<String>,
    pub delete: BTreeSet<String>,
}

pub struct TrackedFileSync {
    state_path: PathBuf,
    lock: Mutex<()>,
}

impl TrackedFileSync {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        TrackedFileSync {
            state_path: state_path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Load the tracked state.
    ///
    /// Returns an empty state if the file does not yet exist. Entries that
    /// are absolute or climb out of the target (`..`) are dropped.
    pub fn load_state(&self) -> Result<TrackedState, SyncError> {
        let state = match persist::load_or_default::<TrackedStateCompat>(&self.state_path)? {
            TrackedStateCompat::Structured(state) => TrackedState {
                synced_at: state.synced_at.unwrap_or_else(Utc::now),
                files: state.files,
            },
            TrackedStateCompat::Legacy(paths) => TrackedState {
                synced_at: Utc::now(),
                files: paths.into_iter().map(|p| (p, String::new())).collect(),
            },
        };
        Ok(sanitize(state, &self.state_path))
    }

    /// Dry run: which files a sync from `source` would copy and which
    /// previously-tracked files it would delete.
    pub fn plan(&self, source: &Path) -> Result<TrackedPlan, SyncError> {
        let current = tree::list_files(source)?;
        let previous = self.previous_or_empty();
        let delete = previous
            .files
            .keys()
            .filter(|path| !current.contains(*path))
            .cloned()
            .collect();
        Ok(TrackedPlan {
            copy: current,
            delete,
        })
    }

    /// Sync `source` onto `target`.
    ///
    /// 1. Current = every file in `source` (VCS metadata excluded).
    /// 2. Previous = the persisted state (empty when missing or unreadable).
    /// 3. Copy each Current file; a failed copy is logged and skipped.
    /// 4. Delete Previous − Current from `target`; already-missing files are
    ///    fine, failed deletions are logged and left.
    /// 5. Persist Current as the new state.
    ///
    /// Only enumerating `source` can fail the call; per-file problems are
    /// reported in the returned summary.
    pub fn sync(&self, source: &Path, target: &Path) -> Result<ApplySummary, SyncError> {
        let _guard = self.lock_inner();
        let current = tree::list_files(source)?;
        let previous = self.previous_or_empty();

        let mut summary = ApplySummary::default();
        let mut recorded = TrackedFiles::new();
        for relative in &current {
            match tree::copy_file(source, target, relative) {
                Ok(outcome) => {
                    match outcome {
                        CopyOutcome::Copied => summary.copied += 1,
                        CopyOutcome::Unchanged => summary.unchanged += 1,
                    }
                    let digest = tree::sha256_file(&source.join(relative)).unwrap_or_default();
                    recorded.insert(relative.clone(), digest);
                }
                Err(err) => {
                    summary.skipped += 1;
                    tracing::warn!("tracked sync skipped {relative}: {err}");
                    // Still tracked: it belongs to the source tree.
                    recorded.insert(relative.clone(), String::new());
                }
            }
        }

        for relative in previous.files.keys().filter(|p| !current.contains(*p)) {
            let path = target.join(relative);
            match tree::remove_file_if_exists(&path) {
                Ok(true) => {
                    summary.deleted += 1;
                    tracing::info!("removed untracked-upstream file {}", path.display());
                }
                Ok(false) => tracing::debug!("already gone: {}", path.display()),
                Err(err) => {
                    summary.delete_failed += 1;
                    tracing::warn!("could not remove {}: {err}", path.display());
                }
            }
        }

        self.save_files(recorded);
        Ok(summary)
    }

    /// Record `source`'s file set as the tracked state without copying.
    ///
    /// Used after an overlay or mirror apply so switching to tracked mode
    /// later starts from an accurate baseline.
    pub fn record(&self, source: &Path) -> Result<(), SyncError> {
        let _guard = self.lock_inner();
        let files = tree::list_files(source)?
            .into_iter()
            .map(|relative| {
                let digest = tree::sha256_file(&source.join(&relative)).unwrap_or_default();
                (relative, digest)
            })
            .collect();
        self.save_files(files);
        Ok(())
    }

    fn previous_or_empty(&self) -> TrackedState {
        self.load_state().unwrap_or_else(|err| {
            tracing::warn!("tracked state unreadable, treating as empty: {err}");
            TrackedState::default()
        })
    }

    fn save_files(&self, files: TrackedFiles) {
        let state = TrackedState {
            synced_at: Utc::now(),
            files,
        };
        if let Err(err) = persist::save_atomic(&self.state_path, &state) {
            tracing::error!("failed to persist tracked state: {err}");
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sanitize(mut state: TrackedState, origin: &Path) -> TrackedState {
    state.files.retain(|path, _| {
        let safe = tree::is_safe_relative(path);
        if !safe {
            tracing::warn!("dropping unsafe tracked path {path:?} from {}", origin.display());
        }
        safe
    });
    state
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn missing_state_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let sync = TrackedFileSync::new(tmp.path().join("tracked-files.json"));
        assert!(sync.load_state().unwrap().files.is_empty());
    }

    #[test]
    fn legacy_list_loads_and_unsafe_paths_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tracked-files.json");
        fs::write(&path, r#"["a.yaml", "../../etc/passwd", "/abs", "dir/b.yaml"]"#).unwrap();
        let state = TrackedFileSync::new(&path).load_state().unwrap();
        let keys: Vec<_> = state.files.keys().cloned().collect();
        assert_eq!(keys, vec!["a.yaml".to_string(), "dir/b.yaml".to_string()]);
    }

    #[test]
    fn plan_reports_copies_and_deletions() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        write(src.path(), "a.yaml", "a");
        write(src.path(), "b.yaml", "b");
        let sync = TrackedFileSync::new(tmp.path().join("tracked-files.json"));
        sync.record(src.path()).unwrap();

        fs::remove_file(src.path().join("b.yaml")).unwrap();
        let plan = sync.plan(src.path()).unwrap();
        assert!(plan.copy.contains("a.yaml"));
        assert_eq!(plan.delete.into_iter().collect::<Vec<_>>(), vec!["b.yaml"]);
    }

    #[test]
    fn sync_persists_digests() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.yaml", "hello");
        let sync = TrackedFileSync::new(tmp.path().join("tracked-files.json"));

        let summary = sync.sync(src.path(), dst.path()).unwrap();
        assert_eq!(summary.copied, 1);
        let state = sync.load_state().unwrap();
        assert_eq!(
            state.files.get("a.yaml").map(String::as_str),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }
}
