//! Backup store — timestamped archives of the target tree.
//!
//! Archives live flat in one directory as
//! `backup-<YYYYMMDDTHHMMSSmmmZ>-<seq>.<ext>`. The protection set is a
//! separate `protected.json` document (name → pinned) next to them, written
//! with the atomic `.tmp` + rename pattern. An archive is written to a
//! `.partial` sibling and renamed into place once complete, so a listed
//! backup is always a finished one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tether_core::{paths, BackupName, BackupRef};

use crate::archive::{Archiver, TarGzArchiver};
use crate::error::SyncError;
use crate::persist;

const NAME_PREFIX: &str = "backup-";

type ProtectionSet = BTreeMap<String, bool>;

/// What a prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<BackupName>,
    pub failed: Vec<BackupName>,
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    /// The backup that was extracted over the target.
    pub restored: BackupName,
    /// The safety snapshot of the target taken just before restoring.
    pub safety_backup: BackupName,
}

pub struct BackupStore {
    dir: PathBuf,
    archiver: Box<dyn Archiver>,
    /// Extra directories left out of every archive.
    skips: Vec<PathBuf>,
    // Serializes read-modify-write of the protection set and name allocation.
    lock: Mutex<()>,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_archiver(dir, Box::new(TarGzArchiver))
    }

    pub fn with_archiver(dir: impl Into<PathBuf>, archiver: Box<dyn Archiver>) -> Self {
        BackupStore {
            dir: dir.into(),
            archiver,
            skips: Vec::new(),
            lock: Mutex::new(()),
        }
    }

    /// Leave `dir` out of every archive (and so out of every restore).
    pub fn with_skip(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skips.push(dir.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `source` into a new archive.
    ///
    /// The backup directory itself, and any directory added with
    /// [`with_skip`](Self::with_skip), is skipped when it lives inside
    /// `source`.
    pub fn create(&self, source: &Path) -> Result<BackupRef, SyncError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SyncError::Backup(format!("create {}: {e}", self.dir.display())))?;

        let (name, path) = {
            let _guard = self.lock_inner();
            let (name, path) = self.allocate_name(Utc::now());
            // Reserve the name before releasing the lock.
            std::fs::File::create(self.partial_path(&path))
                .map_err(|e| SyncError::Backup(format!("reserve {}: {e}", path.display())))?;
            (name, path)
        };

        let partial = self.partial_path(&path);
        let mut skip = vec![self.dir.clone()];
        skip.extend(self.skips.iter().cloned());
        if let Err(err) = self.archiver.create(source, &partial, &skip) {
            let _ = std::fs::remove_file(&partial);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&partial, &path) {
            let _ = std::fs::remove_file(&partial);
            return Err(SyncError::Backup(format!("finalize {}: {err}", path.display())));
        }

        let backup = self.describe(&name, &path, &ProtectionSet::new())?;
        tracing::info!("backup created: {} ({} bytes)", backup.name, backup.size);
        Ok(backup)
    }

    /// All finished backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupRef>, SyncError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SyncError::Backup(format!("list {}: {err}", self.dir.display()))),
        };
        let protection = self.load_protection()?;
        let suffix = format!(".{}", self.archiver.extension());

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !file_name.starts_with(NAME_PREFIX) || !file_name.ends_with(&suffix) {
                continue;
            }
            let name = BackupName::from(file_name);
            backups.push(self.describe(&name, &entry.path(), &protection)?);
        }
        backups.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.name.cmp(&a.name)));
        Ok(backups)
    }

    /// Look up one backup by name.
    pub fn get(&self, name: &BackupName) -> Result<BackupRef, SyncError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(SyncError::not_found("backup", name.to_string()));
        }
        let protection = self.load_protection()?;
        self.describe(name, &path, &protection)
    }

    /// Extract `name` over `target`. A missing archive is a backup failure
    /// here, not a lookup miss.
    pub fn restore(&self, name: &BackupName, target: &Path) -> Result<(), SyncError> {
        let backup = self.get(name).map_err(|err| match err {
            SyncError::NotFound { .. } => SyncError::Backup(format!("restore {name}: {err}")),
            other => other,
        })?;
        self.archiver.extract(&backup.path, target)?;
        tracing::info!("restored backup {} into {}", name, target.display());
        Ok(())
    }

    /// Pin a backup so pruning and deletion skip it. Idempotent.
    pub fn protect(&self, name: &BackupName) -> Result<(), SyncError> {
        self.set_protected(name, true)
    }

    /// Unpin a backup. Idempotent.
    pub fn unprotect(&self, name: &BackupName) -> Result<(), SyncError> {
        self.set_protected(name, false)
    }

    /// Delete the oldest unprotected backups until at most `retention`
    /// unprotected ones remain. Deletion failures are logged and reported,
    /// never returned as errors.
    pub fn prune(&self, retention: usize) -> PruneReport {
        let mut report = PruneReport::default();
        let backups = match self.list() {
            Ok(backups) => backups,
            Err(err) => {
                tracing::warn!("backup prune skipped: {err}");
                return report;
            }
        };

        for backup in backups.into_iter().filter(|b| !b.protected).skip(retention) {
            match std::fs::remove_file(&backup.path) {
                Ok(()) => {
                    tracing::info!("pruned backup {}", backup.name);
                    report.deleted.push(backup.name);
                }
                Err(err) => {
                    tracing::warn!("failed to prune backup {}: {err}", backup.name);
                    report.failed.push(backup.name);
                }
            }
        }
        report
    }

    /// Remove one backup. Protected backups must be unprotected first.
    pub fn delete(&self, name: &BackupName) -> Result<(), SyncError> {
        let backup = self.get(name)?;
        if backup.protected {
            return Err(SyncError::Protected(name.to_string()));
        }
        std::fs::remove_file(&backup.path)
            .map_err(|e| SyncError::Backup(format!("delete {}: {e}", backup.path.display())))?;

        let _guard = self.lock_inner();
        let mut protection = self.load_protection()?;
        if protection.remove(name.as_str()).is_some() {
            self.save_protection(&protection)?;
        }
        tracing::info!("deleted backup {name}");
        Ok(())
    }

    /// Restore `name` (or the newest backup) over `target`, taking a safety
    /// backup of the current target first.
    pub fn rollback(
        &self,
        name: Option<&BackupName>,
        target: &Path,
    ) -> Result<RollbackOutcome, SyncError> {
        let chosen = match name {
            Some(name) => self.get(name)?,
            None => self
                .list()?
                .into_iter()
                .next()
                .ok_or_else(|| SyncError::not_found("backup", "latest"))?,
        };

        std::fs::create_dir_all(target)
            .map_err(|e| SyncError::Backup(format!("create {}: {e}", target.display())))?;
        let safety = self.create(target)?;
        self.archiver.extract(&chosen.path, target)?;
        tracing::info!(
            "rolled back {} to {} (safety backup {})",
            target.display(),
            chosen.name,
            safety.name
        );
        Ok(RollbackOutcome {
            restored: chosen.name,
            safety_backup: safety.name,
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate_name(&self, now: DateTime<Utc>) -> (BackupName, PathBuf) {
        let stamp = now.format("%Y%m%dT%H%M%S%3fZ");
        let mut seq = 0u32;
        loop {
            let file_name = format!("{NAME_PREFIX}{stamp}-{seq:03}.{}", self.archiver.extension());
            let path = self.dir.join(&file_name);
            if !path.exists() && !self.partial_path(&path).exists() {
                return (BackupName::from(file_name), path);
            }
            seq += 1;
        }
    }

    fn partial_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.partial", path.display()))
    }

    fn path_for(&self, name: &BackupName) -> Result<PathBuf, SyncError> {
        let raw = name.as_str();
        if raw.is_empty() || raw.contains('/') || raw.contains('\\') || raw.starts_with('.') {
            return Err(SyncError::not_found("backup", raw));
        }
        Ok(self.dir.join(raw))
    }

    fn describe(
        &self,
        name: &BackupName,
        path: &Path,
        protection: &ProtectionSet,
    ) -> Result<BackupRef, SyncError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| SyncError::Backup(format!("stat {}: {e}", path.display())))?;
        let created = parse_created(name.as_str())
            .or_else(|| meta.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_else(Utc::now);
        Ok(BackupRef {
            name: name.clone(),
            path: path.to_path_buf(),
            created,
            size: meta.len(),
            protected: protection.get(name.as_str()).copied().unwrap_or(false),
        })
    }

    fn set_protected(&self, name: &BackupName, protected: bool) -> Result<(), SyncError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(SyncError::not_found("backup", name.to_string()));
        }
        let _guard = self.lock_inner();
        let mut protection = self.load_protection()?;
        let changed = if protected {
            protection.insert(name.to_string(), true) != Some(true)
        } else {
            protection.remove(name.as_str()).is_some()
        };
        if changed {
            self.save_protection(&protection)?;
            tracing::info!(
                "backup {name} {}",
                if protected { "protected" } else { "unprotected" }
            );
        }
        Ok(())
    }

    fn load_protection(&self) -> Result<ProtectionSet, SyncError> {
        persist::load_or_default(&paths::protection_path(&self.dir))
    }

    fn save_protection(&self, protection: &ProtectionSet) -> Result<(), SyncError> {
        persist::save_atomic(&paths::protection_path(&self.dir), protection)
    }
}

/// Parse the timestamp embedded in a backup name.
fn parse_created(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(NAME_PREFIX)?.get(..19)?;
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S%3f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target_with(content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("configuration.yaml"), content).unwrap();
        dir
    }

    #[test]
    fn created_names_are_unique_and_sorted_newest_first() {
        let target = target_with("v1");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());

        let a = store.create(target.path()).unwrap();
        let b = store.create(target.path()).unwrap();
        assert_ne!(a.name, b.name);
        assert!(a.name.as_str().starts_with("backup-"));
        assert!(a.name.as_str().ends_with(".tar.gz"));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, b.name, "newest first");
    }

    #[test]
    fn parse_created_reads_embedded_timestamp() {
        let created = parse_created("backup-20261018T101500123Z-000.tar.gz").unwrap();
        assert_eq!(created.to_rfc3339(), "2026-10-18T10:15:00.123+00:00");
        assert!(parse_created("random.tar.gz").is_none());
    }

    #[test]
    fn imported_archive_without_timestamp_sorts_by_mtime() {
        use filetime::{set_file_mtime, FileTime};
        use std::time::{Duration, SystemTime};

        let target = target_with("v1");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let imported = store_dir.path().join("backup-imported.tar.gz");
        std::fs::write(&imported, "").unwrap();
        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
        set_file_mtime(&imported, old).unwrap();
        let fresh = store.create(target.path()).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed[0].name, fresh.name);
        assert_eq!(listed[1].name.as_str(), "backup-imported.tar.gz");
    }

    #[test]
    fn list_ignores_partials_and_protection_file() {
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        std::fs::write(
            store_dir.path().join("backup-20260101T000000000Z-000.tar.gz.partial"),
            "",
        )
        .unwrap();
        std::fs::write(store_dir.path().join("protected.json"), "{}").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_retention_plus_protected() {
        let target = target_with("v1");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let names: Vec<_> = (0..5)
            .map(|_| store.create(target.path()).unwrap().name)
            .collect();
        // Oldest one is pinned.
        store.protect(&names[0]).unwrap();

        let report = store.prune(2);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());

        let remaining: Vec<_> = store.list().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&names[0]));
        assert!(remaining.contains(&names[4]));
        assert!(remaining.contains(&names[3]));
    }

    #[test]
    fn protect_is_idempotent_and_blocks_delete() {
        let target = target_with("v1");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let name = store.create(target.path()).unwrap().name;

        store.protect(&name).unwrap();
        store.protect(&name).unwrap();
        assert!(store.get(&name).unwrap().protected);

        let err = store.delete(&name).unwrap_err();
        assert!(matches!(err, SyncError::Protected(_)), "got: {err}");

        store.unprotect(&name).unwrap();
        store.unprotect(&name).unwrap();
        store.delete(&name).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn unknown_or_traversing_names_are_not_found() {
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        for raw in ["backup-missing.tar.gz", "../escape.tar.gz", ""] {
            let err = store.protect(&BackupName::from(raw)).unwrap_err();
            assert!(matches!(err, SyncError::NotFound { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn restore_of_missing_archive_is_backup_error() {
        let target = target_with("current");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let err = store
            .restore(&BackupName::from("backup-missing.tar.gz"), target.path())
            .unwrap_err();
        assert!(matches!(err, SyncError::Backup(_)), "got: {err}");
        assert_eq!(
            std::fs::read_to_string(target.path().join("configuration.yaml")).unwrap(),
            "current"
        );
    }

    #[test]
    fn rollback_restores_latest_and_takes_safety_backup() {
        let target = target_with("good");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let good = store.create(target.path()).unwrap();

        std::fs::write(target.path().join("configuration.yaml"), "broken").unwrap();
        let outcome = store.rollback(None, target.path()).unwrap();

        assert_eq!(outcome.restored, good.name);
        assert_ne!(outcome.safety_backup, good.name);
        assert_eq!(
            std::fs::read_to_string(target.path().join("configuration.yaml")).unwrap(),
            "good"
        );
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn rollback_without_backups_is_not_found_and_untouched() {
        let target = target_with("current");
        let store_dir = TempDir::new().unwrap();
        let store = BackupStore::new(store_dir.path());
        let err = store.rollback(None, target.path()).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }), "got: {err}");
        assert!(store.list().unwrap().is_empty(), "no safety backup taken");
    }
}
