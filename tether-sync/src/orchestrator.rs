//! Sync orchestrator — the one entrypoint for running the pipeline.
//!
//! Stages, in order:
//!
//! 1. Discard any stale temporary clone.
//! 2. `BackingUp`   — snapshot the target (when backups are enabled).
//! 3. `Cloning`     — fetch the configured branch into a temporary tree.
//! 4. Strip version-control metadata.
//! 5. `Validating`  — structural check; the target is still untouched.
//! 6. `Applying`    — overlay / tracked / mirror, per config.
//! 7. `CleaningUp`  — remove the temporary tree, prune old backups.
//! 8. Ask for a service restart (when enabled).
//!
//! Any failure before `Applying` leaves the target exactly as it was. Every
//! outcome lands in the history ledger and goes out to observers.
//!
//! At most one run (or rollback) holds the single-flight guard at a time; a
//! second caller gets [`SyncError::Busy`] immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use tether_core::{
    paths, ApplyMode, BackupName, Config, NewSyncEntry, PipelineStage, SyncEntryUpdate, SyncId,
    SyncType,
};

use crate::backup::{BackupStore, RollbackOutcome};
use crate::capability::{Attributes, CloneRequest, Notifier, RepoCloner, RestartHook};
use crate::error::{Severity, SyncError};
use crate::history::HistoryStore;
use crate::tracked::TrackedFileSync;
use crate::tree::{self, ApplySummary};
use crate::validate;
use crate::webhook::PushInfo;

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Webhook(PushInfo),
    Manual,
}

impl Trigger {
    pub fn sync_type(&self) -> SyncType {
        match self {
            Trigger::Webhook(_) => SyncType::Webhook,
            Trigger::Manual => SyncType::Manual,
        }
    }

    fn new_entry(&self, branch: &str) -> NewSyncEntry {
        match self {
            Trigger::Webhook(push) => NewSyncEntry {
                sync_type: SyncType::Webhook,
                branch: branch.to_string(),
                commits: push.commits,
                message: push.message.clone(),
            },
            Trigger::Manual => NewSyncEntry {
                sync_type: SyncType::Manual,
                branch: branch.to_string(),
                commits: 0,
                message: Some("manual sync".to_string()),
            },
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub sync_id: Option<SyncId>,
    pub sync_type: SyncType,
    pub branch: String,
    pub mode: ApplyMode,
    pub backup: Option<BackupName>,
    pub apply: ApplySummary,
    pub pruned: usize,
    pub restart_scheduled: bool,
    pub duration_ms: u64,
}

/// Result of a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub restored: BackupName,
    pub safety_backup: BackupName,
    pub restart_scheduled: bool,
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Lifecycle events emitted by the orchestrator.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    Stage {
        sync_id: Option<&'a SyncId>,
        stage: PipelineStage,
    },
    Succeeded(&'a SyncReport),
    Failed {
        sync_id: Option<&'a SyncId>,
        sync_type: SyncType,
        error: &'a SyncError,
    },
    RolledBack(&'a RollbackReport),
    RollbackFailed(&'a SyncError),
}

/// Receives every [`PipelineEvent`]. Observers cannot fail the pipeline.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent<'_>);
}

/// Turns terminal events into user notifications.
pub struct NotifyObserver {
    notifier: Arc<dyn Notifier>,
    prefix: String,
}

impl NotifyObserver {
    pub fn new(notifier: Arc<dyn Notifier>, prefix: impl Into<String>) -> Self {
        NotifyObserver {
            notifier,
            prefix: prefix.into(),
        }
    }
}

impl PipelineObserver for NotifyObserver {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        let mut attrs = Attributes::new();
        let (title, message) = match event {
            PipelineEvent::Stage { .. } => return,
            PipelineEvent::Succeeded(report) => {
                if let Some(id) = &report.sync_id {
                    attrs.insert("sync_id".into(), id.to_string());
                }
                attrs.insert("branch".into(), report.branch.clone());
                attrs.insert("duration_ms".into(), report.duration_ms.to_string());
                if let Some(backup) = &report.backup {
                    attrs.insert("backup".into(), backup.to_string());
                }
                (
                    "sync succeeded",
                    format!(
                        "{} sync of {}: {} copied, {} unchanged, {} deleted",
                        report.sync_type,
                        report.branch,
                        report.apply.copied,
                        report.apply.unchanged,
                        report.apply.deleted
                    ),
                )
            }
            PipelineEvent::Failed {
                sync_id,
                sync_type,
                error,
            } => {
                if let Some(id) = sync_id {
                    attrs.insert("sync_id".into(), id.to_string());
                }
                attrs.insert("type".into(), sync_type.to_string());
                let severity = match error.severity() {
                    Severity::TargetUntouched => "target_untouched",
                    Severity::Critical => "critical",
                    Severity::Minor => "minor",
                };
                attrs.insert("severity".into(), severity.into());
                ("sync failed", error.to_string())
            }
            PipelineEvent::RolledBack(report) => {
                attrs.insert("safety_backup".into(), report.safety_backup.to_string());
                (
                    "rollback complete",
                    format!("restored {}", report.restored),
                )
            }
            PipelineEvent::RollbackFailed(error) => ("rollback failed", error.to_string()),
        };
        self.notifier
            .send(&format!("{}: {title}", self.prefix), &message, &attrs);
    }
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

/// Held for the duration of one run; releases the orchestrator on drop.
#[derive(Debug)]
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A claimed, recorded run that has not executed yet.
#[derive(Debug)]
pub struct PendingRun {
    guard: RunGuard,
    sync_id: Option<SyncId>,
    trigger: Trigger,
    started: Instant,
}

impl PendingRun {
    /// Ledger id, when the history entry could be written.
    pub fn sync_id(&self) -> Option<&SyncId> {
        self.sync_id.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator {
    config: Arc<Config>,
    backups: BackupStore,
    history: HistoryStore,
    tracked: TrackedFileSync,
    cloner: Arc<dyn RepoCloner>,
    restart: Option<Arc<dyn RestartHook>>,
    observers: Vec<Arc<dyn PipelineObserver>>,
    busy: Arc<AtomicBool>,
    stage: Mutex<PipelineStage>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<Config>,
        cloner: Arc<dyn RepoCloner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let state = config.state_dir();
        let observer = NotifyObserver::new(notifier, config.notify.title_prefix.clone());
        SyncOrchestrator {
            // The ledger and tracked state must never be rolled back with the
            // target they may be nested in.
            backups: BackupStore::new(config.backup_dir()).with_skip(state.clone()),
            history: HistoryStore::new(paths::history_path(&state), config.history.max_entries),
            tracked: TrackedFileSync::new(paths::tracked_state_path(&state)),
            cloner,
            restart: None,
            observers: vec![Arc::new(observer)],
            busy: Arc::new(AtomicBool::new(false)),
            stage: Mutex::new(PipelineStage::Idle),
            config,
        }
    }

    pub fn with_restart_hook(mut self, hook: Arc<dyn RestartHook>) -> Self {
        self.restart = Some(hook);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn tracked(&self) -> &TrackedFileSync {
        &self.tracked
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Stage of the current run, or the terminal stage of the last one.
    pub fn current_stage(&self) -> PipelineStage {
        self.stage
            .lock()
            .map(|stage| *stage)
            .unwrap_or(PipelineStage::Idle)
    }

    /// Claim the guard and record an in-progress ledger entry.
    ///
    /// Returns [`SyncError::Busy`] without side effects when another run
    /// holds the guard. A ledger write failure is logged; the run proceeds
    /// without an id.
    pub fn begin(&self, trigger: Trigger) -> Result<PendingRun, SyncError> {
        let guard = self.claim()?;
        let started = Instant::now();
        let sync_id = match self
            .history
            .add(trigger.new_entry(&self.config.repository.branch))
        {
            Ok(entry) => Some(entry.id),
            Err(err) => {
                tracing::warn!("could not record sync start: {err}");
                None
            }
        };
        self.set_stage(sync_id.as_ref(), PipelineStage::Idle);
        Ok(PendingRun {
            guard,
            sync_id,
            trigger,
            started,
        })
    }

    /// Run every stage for a claimed run, then release the guard.
    pub fn execute(&self, run: PendingRun) -> Result<SyncReport, SyncError> {
        let PendingRun {
            guard,
            sync_id,
            trigger,
            started,
        } = run;
        let mut backup = None;
        let result = self.run_stages(sync_id.as_ref(), &trigger, started, &mut backup);
        let duration_ms = elapsed_ms(started);

        match &result {
            Ok(report) => {
                tracing::info!(
                    "sync {} finished in {duration_ms} ms ({} copied, {} deleted)",
                    display_id(sync_id.as_ref()),
                    report.apply.copied,
                    report.apply.deleted
                );
                self.record(
                    sync_id.as_ref(),
                    SyncEntryUpdate::success(duration_ms, backup.is_some()),
                );
                self.set_stage(sync_id.as_ref(), PipelineStage::Done);
                self.emit(&PipelineEvent::Succeeded(report));
            }
            Err(err) => {
                tracing::error!("sync {} failed: {err}", display_id(sync_id.as_ref()));
                self.discard_clone();
                self.record(
                    sync_id.as_ref(),
                    SyncEntryUpdate::failed(err.to_string(), duration_ms, backup.is_some()),
                );
                self.set_stage(sync_id.as_ref(), PipelineStage::Failed);
                self.emit(&PipelineEvent::Failed {
                    sync_id: sync_id.as_ref(),
                    sync_type: trigger.sync_type(),
                    error: err,
                });
            }
        }
        drop(guard);
        result
    }

    /// `begin` + `execute`.
    pub fn run(&self, trigger: Trigger) -> Result<SyncReport, SyncError> {
        let pending = self.begin(trigger)?;
        self.execute(pending)
    }

    /// Restore a backup (newest when `name` is `None`) over the target under
    /// the same single-flight guard as a sync.
    pub fn rollback(&self, name: Option<&BackupName>) -> Result<RollbackReport, SyncError> {
        let _guard = self.claim()?;
        match self.backups.rollback(name, &self.config.target_dir) {
            Ok(RollbackOutcome {
                restored,
                safety_backup,
            }) => {
                let report = RollbackReport {
                    restored,
                    safety_backup,
                    restart_scheduled: self.request_restart(),
                };
                self.emit(&PipelineEvent::RolledBack(&report));
                Ok(report)
            }
            Err(err) => {
                tracing::error!("rollback failed: {err}");
                self.emit(&PipelineEvent::RollbackFailed(&err));
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn run_stages(
        &self,
        sync_id: Option<&SyncId>,
        trigger: &Trigger,
        started: Instant,
        backup: &mut Option<BackupName>,
    ) -> Result<SyncReport, SyncError> {
        let config = &self.config;
        let target = &config.target_dir;
        let clone_dir = paths::clone_dir(&config.state_dir());

        tree::remove_dir_if_exists(&clone_dir)
            .map_err(|e| SyncError::Clone(format!("discarding stale clone: {e}")))?;

        if config.backup.enabled {
            self.set_stage(sync_id, PipelineStage::BackingUp);
            std::fs::create_dir_all(target)
                .map_err(|e| SyncError::Backup(format!("create {}: {e}", target.display())))?;
            *backup = Some(self.backups.create(target)?.name);
        }

        self.set_stage(sync_id, PipelineStage::Cloning);
        if let Some(parent) = clone_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Clone(format!("create {}: {e}", parent.display())))?;
        }
        self.cloner
            .clone_branch(&CloneRequest {
                url: &config.repository.url,
                branch: &config.repository.branch,
                token: config.repository.token.as_deref(),
                dest: &clone_dir,
            })
            .map_err(SyncError::Clone)?;
        tree::strip_vcs_metadata(&clone_dir)
            .map_err(|e| SyncError::Clone(format!("stripping VCS metadata: {e}")))?;

        self.set_stage(sync_id, PipelineStage::Validating);
        validate::validate_tree(&clone_dir, &config.sync.required_files)?;

        self.set_stage(sync_id, PipelineStage::Applying);
        let apply = self.apply(&clone_dir).map_err(|err| match err {
            SyncError::Apply(_) => err,
            other => SyncError::Apply(other.to_string()),
        })?;

        self.set_stage(sync_id, PipelineStage::CleaningUp);
        self.discard_clone();
        let pruned = if config.backup.enabled {
            self.backups.prune(config.backup.retention).deleted.len()
        } else {
            0
        };
        let restart_scheduled = self.request_restart();

        Ok(SyncReport {
            sync_id: sync_id.cloned(),
            sync_type: trigger.sync_type(),
            branch: config.repository.branch.clone(),
            mode: config.sync.mode,
            backup: backup.clone(),
            apply,
            pruned,
            restart_scheduled,
            duration_ms: elapsed_ms(started),
        })
    }

    fn apply(&self, clone_dir: &std::path::Path) -> Result<ApplySummary, SyncError> {
        let target = &self.config.target_dir;
        std::fs::create_dir_all(target).map_err(|e| SyncError::Apply(e.to_string()))?;

        let summary = match self.config.sync.mode {
            ApplyMode::Tracked => self.tracked.sync(clone_dir, target)?,
            ApplyMode::Overlay => {
                let files = tree::list_files(clone_dir)?;
                let summary = tree::overlay(clone_dir, target, &files)?;
                self.record_baseline(clone_dir);
                summary
            }
            ApplyMode::Mirror => {
                let files = tree::list_files(clone_dir)?;
                let excludes = self.mirror_excludes();
                let summary = tree::mirror(clone_dir, target, &files, &excludes)?;
                self.record_baseline(clone_dir);
                summary
            }
        };
        if summary.skipped > 0 || summary.delete_failed > 0 {
            tracing::warn!(
                "apply finished with {} skipped copy(ies) and {} failed deletion(s)",
                summary.skipped,
                summary.delete_failed
            );
        }
        Ok(summary)
    }

    /// Configured excludes plus the backup and state directories when they
    /// live inside the target.
    fn mirror_excludes(&self) -> Vec<String> {
        let target = &self.config.target_dir;
        let mut excludes = self.config.sync.mirror_exclude.clone();
        for dir in [self.config.backup_dir(), self.config.state_dir()] {
            if let Ok(relative) = dir.strip_prefix(target) {
                let relative = relative.to_string_lossy().replace('\\', "/");
                if !relative.is_empty() {
                    excludes.push(relative);
                }
            }
        }
        excludes
    }

    fn record_baseline(&self, clone_dir: &std::path::Path) {
        if let Err(err) = self.tracked.record(clone_dir) {
            tracing::warn!("could not record tracked baseline: {err}");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn claim(&self) -> Result<RunGuard, SyncError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::Busy)?;
        Ok(RunGuard {
            flag: Arc::clone(&self.busy),
        })
    }

    fn request_restart(&self) -> bool {
        if !self.config.restart.enabled {
            return false;
        }
        match &self.restart {
            Some(hook) => hook.schedule_restart(Duration::from_secs(self.config.restart.delay_secs)),
            None => {
                tracing::warn!("restart enabled but no restart hook is installed");
                false
            }
        }
    }

    fn discard_clone(&self) {
        let clone_dir = paths::clone_dir(&self.config.state_dir());
        if let Err(err) = tree::remove_dir_if_exists(&clone_dir) {
            tracing::warn!("could not remove temporary clone: {err}");
        }
    }

    fn record(&self, sync_id: Option<&SyncId>, update: SyncEntryUpdate) {
        let Some(id) = sync_id else { return };
        if let Err(err) = self.history.update(id, update) {
            tracing::warn!("could not record sync {id} outcome: {err}");
        }
    }

    fn set_stage(&self, sync_id: Option<&SyncId>, stage: PipelineStage) {
        if let Ok(mut current) = self.stage.lock() {
            *current = stage;
        }
        tracing::debug!("sync {} stage: {stage}", display_id(sync_id));
        self.emit(&PipelineEvent::Stage { sync_id, stage });
    }

    fn emit(&self, event: &PipelineEvent<'_>) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn display_id(sync_id: Option<&SyncId>) -> &str {
    sync_id.map(SyncId::as_str).unwrap_or("-")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
