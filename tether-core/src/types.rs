//! Domain types shared by the sync engine, the daemon and the CLI.
//!
//! All path fields use `PathBuf`; all timestamps are `DateTime<Utc>`.
//! Every type round-trips through serde so the daemon protocol and the
//! persisted ledgers share one representation.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of one pipeline run; ties the run to its history entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(pub String);

impl SyncId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SyncId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SyncId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// File name of a backup archive, e.g. `backup-20261018T034612123Z-000.tar.gz`.
///
/// Names sort chronologically under plain lexical ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupName(pub String);

impl BackupName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BackupName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackupName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Webhook,
    Manual,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::Webhook => write!(f, "webhook"),
            SyncType::Manual => write!(f, "manual"),
        }
    }
}

/// Lifecycle of a history entry: created `InProgress`, finished exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, SyncStatus::InProgress)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::InProgress => write!(f, "in_progress"),
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Pipeline state machine.
///
/// `Idle → BackingUp → Cloning → Validating → Applying → CleaningUp → (Done | Failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    BackingUp,
    Cloning,
    Validating,
    Applying,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::BackingUp => "backing_up",
            PipelineStage::Cloning => "cloning",
            PipelineStage::Validating => "validating",
            PipelineStage::Applying => "applying",
            PipelineStage::CleaningUp => "cleaning_up",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// History ledger
// ---------------------------------------------------------------------------

/// One row per attempted sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub id: SyncId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub branch: String,
    #[serde(default)]
    pub commits: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub backup_created: bool,
}

/// Caller-supplied fields for a new ledger row; id, timestamp and status
/// are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncEntry {
    pub sync_type: SyncType,
    pub branch: String,
    pub commits: u32,
    pub message: Option<String>,
}

/// Fields merged into an existing ledger row. `None` leaves a field as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEntryUpdate {
    pub status: Option<SyncStatus>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub backup_created: Option<bool>,
    pub message: Option<String>,
}

impl SyncEntryUpdate {
    pub fn success(duration_ms: u64, backup_created: bool) -> Self {
        Self {
            status: Some(SyncStatus::Success),
            duration_ms: Some(duration_ms),
            backup_created: Some(backup_created),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64, backup_created: bool) -> Self {
        Self {
            status: Some(SyncStatus::Failed),
            error: Some(error.into()),
            duration_ms: Some(duration_ms),
            backup_created: Some(backup_created),
            ..Self::default()
        }
    }

    pub fn apply_to(self, entry: &mut SyncEntry) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(error) = self.error {
            entry.error = Some(error);
        }
        if let Some(duration_ms) = self.duration_ms {
            entry.duration_ms = Some(duration_ms);
        }
        if let Some(backup_created) = self.backup_created {
            entry.backup_created = backup_created;
        }
        if let Some(message) = self.message {
            entry.message = Some(message);
        }
    }
}

/// Aggregates derived from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Mean duration over finished entries only; `None` when there are none.
    pub average_duration_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

/// One retained backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub name: BackupName,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub protected: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
