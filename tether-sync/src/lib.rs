//! # tether-sync
//!
//! The sync engine: webhook authentication, backups, the history ledger,
//! tracked-file bookkeeping and the pipeline that ties them together.
//!
//! Build a [`SyncOrchestrator`] from a [`tether_core::Config`] plus a
//! [`RepoCloner`] and a [`Notifier`], then call
//! [`SyncOrchestrator::run`] (or `begin` + `execute` to hand back a sync id
//! before the work starts).

pub mod archive;
pub mod backup;
pub mod capability;
pub mod error;
pub mod history;
pub mod orchestrator;
mod persist;
pub mod tracked;
pub mod tree;
pub mod validate;
pub mod webhook;

pub use archive::{Archiver, TarGzArchiver};
pub use backup::{BackupStore, PruneReport, RollbackOutcome};
pub use capability::{
    Attributes, CloneRequest, GitCloner, LogNotifier, MemoryNotifier, Notification, Notifier,
    RepoCloner, RestartHook,
};
pub use error::{Severity, SyncError};
pub use history::HistoryStore;
pub use orchestrator::{
    NotifyObserver, PendingRun, PipelineEvent, PipelineObserver, RollbackReport, SyncOrchestrator,
    SyncReport, Trigger,
};
pub use tracked::{TrackedFileSync, TrackedPlan, TrackedState};
pub use tree::ApplySummary;
pub use webhook::{verify_signature, PushInfo, WebhookDecision, WebhookVerifier};
