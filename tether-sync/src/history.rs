//! Sync history ledger.
//!
//! A bounded, newest-first list of [`SyncEntry`] rows persisted as
//! `history.json` in the state directory. Every mutation is a locked
//! read-modify-write followed by an atomic save.
//!
//! Older deployments wrote the bare array; both shapes load.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_core::{HistoryStats, NewSyncEntry, SyncEntry, SyncEntryUpdate, SyncId, SyncStatus};

use crate::error::SyncError;
use crate::persist;

#[derive(Debug, Serialize)]
struct HistoryFile<'a> {
    entries: &'a [SyncEntry],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryCompat {
    Structured { entries: Vec<SyncEntry> },
    Legacy(Vec<SyncEntry>),
}

impl Default for HistoryCompat {
    fn default() -> Self {
        HistoryCompat::Legacy(Vec::new())
    }
}

impl HistoryCompat {
    fn into_entries(self) -> Vec<SyncEntry> {
        match self {
            HistoryCompat::Structured { entries } | HistoryCompat::Legacy(entries) => entries,
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        HistoryStore {
            path: path.into(),
            max_entries: max_entries.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a new in-progress run at the head of the ledger.
    pub fn add(&self, new: NewSyncEntry) -> Result<SyncEntry, SyncError> {
        let _guard = self.lock_inner();
        let mut entries = self.load()?;
        let entry = SyncEntry {
            id: SyncId::from(Uuid::now_v7().to_string()),
            timestamp: Utc::now(),
            sync_type: new.sync_type,
            status: SyncStatus::InProgress,
            branch: new.branch,
            commits: new.commits,
            message: new.message,
            error: None,
            duration_ms: None,
            backup_created: false,
        };
        entries.insert(0, entry.clone());
        self.save(&mut entries)?;
        Ok(entry)
    }

    /// Merge `update` into the entry `id`. Returns `false` (and logs) when
    /// no such entry exists, which is not an error.
    pub fn update(&self, id: &SyncId, update: SyncEntryUpdate) -> Result<bool, SyncError> {
        let _guard = self.lock_inner();
        let mut entries = self.load()?;
        let Some(entry) = entries.iter_mut().find(|e| &e.id == id) else {
            tracing::warn!("history update for unknown sync id {id}; ignoring");
            return Ok(false);
        };
        update.apply_to(entry);
        self.save(&mut entries)?;
        Ok(true)
    }

    /// Newest-first entries, optionally capped at `limit`.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<SyncEntry>, SyncError> {
        let _guard = self.lock_inner();
        let mut entries = self.load()?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn get(&self, id: &SyncId) -> Result<Option<SyncEntry>, SyncError> {
        let _guard = self.lock_inner();
        Ok(self.load()?.into_iter().find(|e| &e.id == id))
    }

    /// Totals by status and the mean duration over finished entries that
    /// carry one. Rows closed by [`fail_interrupted`](Self::fail_interrupted)
    /// have no duration and are left out of the mean.
    pub fn stats(&self) -> Result<HistoryStats, SyncError> {
        let entries = self.list(None)?;
        let mut stats = HistoryStats {
            total: entries.len(),
            ..HistoryStats::default()
        };
        let mut durations = Vec::new();
        for entry in &entries {
            match entry.status {
                SyncStatus::Success => stats.success += 1,
                SyncStatus::Failed => stats.failed += 1,
                SyncStatus::InProgress => stats.in_progress += 1,
            }
            if entry.status.is_finished() {
                if let Some(ms) = entry.duration_ms {
                    durations.push(ms);
                }
            }
        }
        if !durations.is_empty() {
            let sum: u64 = durations.iter().sum();
            stats.average_duration_ms = Some(sum / durations.len() as u64);
        }
        Ok(stats)
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        let _guard = self.lock_inner();
        self.save(&mut Vec::new())
    }

    /// Mark every in-progress entry as failed with `reason`. Used at start-up
    /// to close out runs interrupted by a crash or restart.
    ///
    /// `duration_ms` stays unset: the time until recovery says nothing about
    /// how long the run took.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, SyncError> {
        let _guard = self.lock_inner();
        let mut entries = self.load()?;
        let mut count = 0;
        for entry in entries
            .iter_mut()
            .filter(|e| e.status == SyncStatus::InProgress)
        {
            entry.status = SyncStatus::Failed;
            entry.error = Some(reason.to_string());
            count += 1;
        }
        if count > 0 {
            self.save(&mut entries)?;
            tracing::warn!("marked {count} interrupted sync(s) as failed");
        }
        Ok(count)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<Vec<SyncEntry>, SyncError> {
        Ok(persist::load_or_default::<HistoryCompat>(&self.path)?.into_entries())
    }

    fn save(&self, entries: &mut Vec<SyncEntry>) -> Result<(), SyncError> {
        entries.truncate(self.max_entries);
        persist::save_atomic(
            &self.path,
            &HistoryFile {
                entries: entries.as_slice(),
            },
        )
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tether_core::SyncType;

    fn manual(message: &str) -> NewSyncEntry {
        NewSyncEntry {
            sync_type: SyncType::Manual,
            branch: "main".to_string(),
            commits: 0,
            message: Some(message.to_string()),
        }
    }

    fn store(tmp: &TempDir, max: usize) -> HistoryStore {
        HistoryStore::new(tmp.path().join("history.json"), max)
    }

    #[test]
    fn add_prepends_and_caps() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 3);
        let ids: Vec<_> = (0..5)
            .map(|i| history.add(manual(&format!("run {i}"))).unwrap().id)
            .collect();

        let entries = history.list(None).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, ids[4]);
        assert_eq!(entries[2].id, ids[2]);
        assert!(entries.iter().all(|e| e.status == SyncStatus::InProgress));
    }

    #[test]
    fn update_merges_fields_and_ignores_unknown_ids() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        let entry = history.add(manual("push")).unwrap();

        assert!(history
            .update(&entry.id, SyncEntryUpdate::success(1200, true))
            .unwrap());
        let stored = history.get(&entry.id).unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Success);
        assert_eq!(stored.duration_ms, Some(1200));
        assert!(stored.backup_created);
        assert_eq!(stored.message.as_deref(), Some("push"));

        assert!(!history
            .update(&SyncId::from("missing"), SyncEntryUpdate::default())
            .unwrap());
        assert_eq!(history.list(None).unwrap().len(), 1);
    }

    #[test]
    fn stats_average_only_finished_entries() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        let a = history.add(manual("a")).unwrap();
        let b = history.add(manual("b")).unwrap();
        history.add(manual("c")).unwrap();
        history.update(&a.id, SyncEntryUpdate::success(100, false)).unwrap();
        history
            .update(&b.id, SyncEntryUpdate::failed("clone failed: x", 300, true))
            .unwrap();

        let stats = history.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.average_duration_ms, Some(200));
    }

    #[test]
    fn empty_ledger_has_no_average() {
        let tmp = TempDir::new().unwrap();
        let stats = store(&tmp, 10).stats().unwrap();
        assert_eq!(stats, HistoryStats::default());
    }

    #[test]
    fn clear_and_list_limit() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        for i in 0..4 {
            history.add(manual(&i.to_string())).unwrap();
        }
        assert_eq!(history.list(Some(2)).unwrap().len(), 2);
        history.clear().unwrap();
        assert!(history.list(None).unwrap().is_empty());
    }

    #[test]
    fn fail_interrupted_closes_in_progress_rows() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        let done = history.add(manual("done")).unwrap();
        history.update(&done.id, SyncEntryUpdate::success(5, false)).unwrap();
        history.add(manual("stuck")).unwrap();

        assert_eq!(history.fail_interrupted("interrupted").unwrap(), 1);
        let stats = history.stats().unwrap();
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(history.fail_interrupted("interrupted").unwrap(), 0);
    }

    #[test]
    fn interrupted_rows_do_not_skew_average_duration() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        let done = history.add(manual("done")).unwrap();
        history.update(&done.id, SyncEntryUpdate::success(40, false)).unwrap();
        let stuck = history.add(manual("stuck")).unwrap();

        history.fail_interrupted("interrupted").unwrap();
        let closed = history.get(&stuck.id).unwrap().unwrap();
        assert_eq!(closed.status, SyncStatus::Failed);
        assert_eq!(closed.duration_ms, None);

        let stats = history.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.average_duration_ms, Some(40));
    }

    #[test]
    fn legacy_bare_array_loads() {
        let tmp = TempDir::new().unwrap();
        let history = store(&tmp, 10);
        let entry = history.add(manual("x")).unwrap();
        let legacy = serde_json::to_string(&vec![entry.clone()]).unwrap();
        std::fs::write(history.path(), legacy).unwrap();

        let loaded = history.list(None).unwrap();
        assert_eq!(loaded, vec![entry]);
    }
}
