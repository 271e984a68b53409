//! `tether daemon` and `tether health`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use tether_daemon::paths::socket_path;
use tether_daemon::{request_status, request_stop, start_blocking, DaemonError, DaemonRequest};

use super::{load_config, print_json, require_daemon};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (socket server + restart timer).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
}

pub fn run(config_path: Option<&Path>, command: DaemonCommand) -> Result<()> {
    let config = load_config(config_path)?;
    let state = config.state_dir();

    match command {
        DaemonCommand::Start => {
            start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&state) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&state) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&state).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}

pub fn health(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let data = require_daemon(&config, &DaemonRequest::Health)?;
    let time = data["time"].as_str().unwrap_or("?");
    println!("{} daemon healthy ({time})", "✓".green().bold());
    Ok(())
}
