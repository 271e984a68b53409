//! tether core library — domain types, configuration, state layout, errors.
//!
//! - [`types`] — newtypes, ledger rows, backup references, pipeline stages
//! - [`config`] — the single [`Config`] structure and its loader
//! - [`paths`] — where persisted state lives
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{ApplyMode, Config, RestartMethod};
pub use error::ConfigError;
pub use types::{
    BackupName, BackupRef, HistoryStats, NewSyncEntry, PipelineStage, SyncEntry, SyncEntryUpdate,
    SyncId, SyncStatus, SyncType,
};
