pub mod backup;
pub mod config;
pub mod daemon;
pub mod history;
pub mod restart;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use tether_core::Config;
use tether_daemon::{notifier_for, request, DaemonError, DaemonRequest};
use tether_sync::{GitCloner, SyncOrchestrator};

/// Load the explicit config file if one was given, `~/.tether/config.yaml`
/// otherwise. Environment overrides are applied and the result validated.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = tether_core::config::load_at(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate().context("config is invalid")?;
            Ok(config)
        }
        None => tether_core::config::load()
            .context("failed to load config; create ~/.tether/config.yaml or pass --config"),
    }
}

/// An in-process engine over the same state the daemon uses. No restart
/// hook: restarts are the daemon's business.
pub fn local_orchestrator(config: Config) -> SyncOrchestrator {
    let notifier = notifier_for(&config.notify);
    SyncOrchestrator::new(Arc::new(config), Arc::new(GitCloner::default()), notifier)
}

/// Send `req` to the daemon. `Ok(None)` means no daemon is running.
pub fn try_daemon(config: &Config, req: &DaemonRequest) -> Result<Option<Value>> {
    match request(&config.state_dir(), req) {
        Ok(data) => Ok(Some(data)),
        Err(DaemonError::DaemonNotRunning { .. }) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("daemon rejected '{}'", req.name())),
    }
}

/// Send `req` to the daemon, failing if it is not running.
pub fn require_daemon(config: &Config, req: &DaemonRequest) -> Result<Value> {
    try_daemon(config, req)?.with_context(|| {
        format!(
            "daemon is not running (start it with `tether daemon start`); '{}' needs it",
            req.name()
        )
    })
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}

/// "1.2s" / "340ms".
pub fn format_duration_ms(ms: Option<u64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{ms}ms"),
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
