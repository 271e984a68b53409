//! State-directory layout.
//!
//! ```text
//! <state_dir>/
//!   config.yaml
//!   history.json         (sync ledger, newest first)
//!   tracked-files.json   (file set copied by the last tracked sync)
//!   backups/
//!     backup-<timestamp>-<seq>.tar.gz
//!     protected.json     (backup name → pinned)
//!   tmp/clone/           (scratch clone, discarded every run)
//! ```

use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".tether";
pub const CONFIG_FILE: &str = "config.yaml";
pub const HISTORY_FILE: &str = "history.json";
pub const TRACKED_FILE: &str = "tracked-files.json";
pub const PROTECTION_FILE: &str = "protected.json";

pub fn state_dir(home: &Path) -> PathBuf {
    home.join(STATE_DIR_NAME)
}

pub fn config_path(home: &Path) -> PathBuf {
    state_dir(home).join(CONFIG_FILE)
}

pub fn history_path(state: &Path) -> PathBuf {
    state.join(HISTORY_FILE)
}

pub fn tracked_state_path(state: &Path) -> PathBuf {
    state.join(TRACKED_FILE)
}

pub fn backups_dir(state: &Path) -> PathBuf {
    state.join("backups")
}

pub fn protection_path(backup_dir: &Path) -> PathBuf {
    backup_dir.join(PROTECTION_FILE)
}

pub fn clone_dir(state: &Path) -> PathBuf {
    state.join("tmp").join("clone")
}
