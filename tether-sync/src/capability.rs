//! Injected capabilities: fetching the remote tree, notifying people, and
//! scheduling a service restart. The pipeline only sees these traits.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

/// Free-form key/value pairs attached to a notification.
pub type Attributes = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// One shallow, single-branch fetch.
#[derive(Debug, Clone, Copy)]
pub struct CloneRequest<'a> {
    pub url: &'a str,
    pub branch: &'a str,
    pub token: Option<&'a str>,
    pub dest: &'a Path,
}

pub trait RepoCloner: Send + Sync {
    /// Materialize `request.branch` of `request.url` into `request.dest`.
    /// The error string is shown to operators; it must not contain the token.
    fn clone_branch(&self, request: &CloneRequest<'_>) -> Result<(), String>;
}

/// Shells out to `git clone --depth 1 --single-branch`.
#[derive(Debug, Clone)]
pub struct GitCloner {
    program: String,
}

impl Default for GitCloner {
    fn default() -> Self {
        GitCloner {
            program: "git".to_string(),
        }
    }
}

impl GitCloner {
    pub fn with_program(program: impl Into<String>) -> Self {
        GitCloner {
            program: program.into(),
        }
    }
}

impl RepoCloner for GitCloner {
    fn clone_branch(&self, request: &CloneRequest<'_>) -> Result<(), String> {
        let url = authenticated_url(request.url, request.token);
        let output = Command::new(&self.program)
            .args(["clone", "--depth", "1", "--single-branch", "--branch"])
            .arg(request.branch)
            .arg(&url)
            .arg(request.dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| format!("failed to run {}: {e}", self.program))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = stderr.trim().to_string();
        if let Some(token) = request.token.filter(|t| !t.is_empty()) {
            message = message.replace(token, "***");
        }
        if message.is_empty() {
            message = format!("git exited with {}", output.status);
        }
        Err(message)
    }
}

/// Embed `token` as HTTPS basic-auth credentials. Non-HTTPS URLs are
/// returned unchanged.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (token.filter(|t| !t.is_empty()), url.strip_prefix("https://")) {
        (Some(token), Some(rest)) if !rest.contains('@') => {
            format!("https://x-access-token:{token}@{rest}")
        }
        _ => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Fire-and-forget user notification. Implementations swallow their own
/// failures.
pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, message: &str, attributes: &Attributes);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, title: &str, message: &str, attributes: &Attributes) {
        tracing::info!("notification: {title}: {message} {attributes:?}");
    }
}

/// A sent notification, as captured by [`MemoryNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub attributes: Attributes,
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn send(&self, title: &str, message: &str, attributes: &Attributes) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Notification {
                title: title.to_string(),
                message: message.to_string(),
                attributes: attributes.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

/// Accepts a request to restart the managed service after `delay`.
pub trait RestartHook: Send + Sync {
    /// Returns whether a restart is now pending.
    fn schedule_restart(&self, delay: Duration) -> bool;
}
