//! Deployment configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.tether/
//!   config.yaml      (mode 0600 — holds repository and webhook secrets)
//! ```
//!
//! # API pattern
//!
//! Every function touching the filesystem has two forms:
//! - `fn_at(home: &Path, …)` or `fn_at(path: &Path)` — explicit location; used in tests
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! The loaded [`Config`] is constructed once at startup and shared by
//! reference; nothing else in the workspace reads the process environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::paths;

const REDACTED: &str = "***";

// ---------------------------------------------------------------------------
// 1. Structure
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    /// Directory kept in sync with the repository. Must be absolute.
    pub target_dir: PathBuf,
    /// Where ledgers, backups and the daemon socket live.
    /// Defaults to the directory holding `config.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub manual_trigger: ManualTriggerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Access token injected into HTTPS clone URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret. Without it no webhook ever verifies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Event kind that triggers a sync (`X-GitHub-Event` value).
    #[serde(default = "default_event")]
    pub event: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            event: default_event(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualTriggerConfig {
    /// Optional shared secret required by manual triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// How cloned content is applied to the target directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Overwrite matching paths; never delete anything.
    Overlay,
    /// Overwrite matching paths; delete only files a previous sync copied.
    #[default]
    Tracked,
    /// Destructive: delete everything not in the source unless excluded.
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: ApplyMode,
    /// Relative paths (or directory prefixes) `mirror` mode never deletes.
    #[serde(default)]
    pub mirror_exclude: Vec<String>,
    /// Top-level files that must exist and be non-empty in every clone.
    #[serde(default = "default_required_files")]
    pub required_files: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: ApplyMode::default(),
            mirror_exclude: Vec::new(),
            required_files: default_required_files(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unprotected backups kept after pruning.
    #[serde(default = "default_retention")]
    pub retention: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: default_retention(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Grace delay between a successful sync and the restart.
    #[serde(default = "default_restart_delay")]
    pub delay_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RestartMethod>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_secs: default_restart_delay(),
            method: None,
        }
    }
}

/// How the consuming service is restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RestartMethod {
    /// POST to a control-plane endpoint.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Run a local program; a non-zero exit is a failure.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// JSON POST endpoint; notifications are only logged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            url: None,
            title_prefix: default_title_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_event() -> String {
    "push".to_string()
}
fn default_required_files() -> Vec<String> {
    vec!["configuration.yaml".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_retention() -> usize {
    10
}
fn default_restart_delay() -> u64 {
    10
}
fn default_title_prefix() -> String {
    "tether".to_string()
}
fn default_max_entries() -> usize {
    100
}

// ---------------------------------------------------------------------------
// 2. Derived values
// ---------------------------------------------------------------------------

impl Config {
    /// Minimal config for a repository and target; every other section defaulted.
    pub fn new(url: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig {
                url: url.into(),
                branch: default_branch(),
                token: None,
            },
            target_dir: target_dir.into(),
            state_dir: None,
            webhook: WebhookConfig::default(),
            manual_trigger: ManualTriggerConfig::default(),
            sync: SyncConfig::default(),
            backup: BackupConfig::default(),
            restart: RestartConfig::default(),
            notify: NotifyConfig::default(),
            history: HistoryConfig::default(),
        }
    }

    /// Resolved state directory. Loaders fill `state_dir` in, so the
    /// relative fallback only applies to configs built in memory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(paths::STATE_DIR_NAME))
    }

    /// Resolved backup archive directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .unwrap_or_else(|| paths::backups_dir(&self.state_dir()))
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.url.trim().is_empty() {
            return Err(ConfigError::Invalid("repository.url is empty".to_string()));
        }
        if self.repository.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("repository.branch is empty".to_string()));
        }
        if !self.target_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "target_dir must be absolute, got {}",
                self.target_dir.display()
            )));
        }
        if self.backup_dir() == self.target_dir {
            return Err(ConfigError::Invalid(
                "backup.dir must differ from target_dir".to_string(),
            ));
        }
        if self.history.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "history.max_entries must be at least 1".to_string(),
            ));
        }
        if self.restart.enabled && self.restart.method.is_none() {
            return Err(ConfigError::Invalid(
                "restart.enabled requires restart.method".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply secret overrides from an environment lookup.
    ///
    /// The lookup is injected so callers decide where values come from;
    /// startup passes `std::env::var`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(token) = non_empty("TETHER_REPO_TOKEN") {
            self.repository.token = Some(token);
        }
        if let Some(branch) = non_empty("TETHER_REPO_BRANCH") {
            self.repository.branch = branch;
        }
        if let Some(secret) = non_empty("TETHER_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(token) = non_empty("TETHER_MANUAL_TOKEN") {
            self.manual_trigger.token = Some(token);
        }
        if let Some(raw) = non_empty("TETHER_RESTART_DELAY_SECS") {
            match raw.parse::<u64>() {
                Ok(value) => self.restart.delay_secs = value,
                Err(err) => {
                    tracing::warn!("invalid TETHER_RESTART_DELAY_SECS, ignoring: {err}");
                }
            }
        }
    }

    /// Snapshot safe to hand to the query interface: every secret masked.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        let mask = |value: &mut Option<String>| {
            if value.is_some() {
                *value = Some(REDACTED.to_string());
            }
        };
        mask(&mut copy.repository.token);
        mask(&mut copy.webhook.secret);
        mask(&mut copy.manual_trigger.token);
        if let Some(RestartMethod::Http { token, .. }) = copy.restart.method.as_mut() {
            mask(token);
        }
        copy
    }
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load `config.yaml` from an explicit path.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with
/// path + line context) if malformed. A missing `state_dir` resolves to
/// the directory containing the file.
pub fn load_at(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let mut config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    if config.state_dir.is_none() {
        config.state_dir = path.parent().map(Path::to_path_buf);
    }
    Ok(config)
}

/// Load `<home>/.tether/config.yaml`, apply environment overrides and validate.
pub fn load_from_home_at<F>(home: &Path, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_at(&paths::config_path(home))?;
    config.apply_env_overrides(lookup);
    config.validate()?;
    Ok(config)
}

/// `load_from_home_at` convenience wrapper using the real home and environment.
pub fn load() -> Result<Config, ConfigError> {
    load_from_home_at(&home()?, |key| std::env::var(key).ok())
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write `config` to `path`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
