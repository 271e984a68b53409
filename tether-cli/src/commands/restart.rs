//! `tether restart` — the delayed restart timer lives in the daemon, so
//! every subcommand needs it running.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use tether_daemon::DaemonRequest;

use super::{load_config, require_daemon};

#[derive(Subcommand, Debug)]
pub enum RestartCommand {
    /// Schedule a restart, replacing any pending one.
    Schedule {
        /// Seconds to wait (defaults to `restart.delay_secs`).
        #[arg(long)]
        delay: Option<u64>,
    },
    /// Cancel the pending restart, if any.
    Cancel,
    /// Show whether a restart is pending and when it fires.
    Status,
}

pub fn run(config_path: Option<&Path>, command: RestartCommand) -> Result<()> {
    let config = load_config(config_path)?;

    match command {
        RestartCommand::Schedule { delay } => {
            let data = require_daemon(
                &config,
                &DaemonRequest::ScheduleRestart { delay_secs: delay },
            )?;
            if data["scheduled"].as_bool().unwrap_or(false) {
                println!(
                    "restart scheduled for {}",
                    data["fire_at"].as_str().unwrap_or("?")
                );
            } else {
                println!("restart not scheduled (auto-restart is disabled)");
            }
        }
        RestartCommand::Cancel => {
            let data = require_daemon(&config, &DaemonRequest::CancelRestart)?;
            if data["cancelled"].as_bool().unwrap_or(false) {
                println!("pending restart cancelled");
            } else {
                println!("no restart was pending");
            }
        }
        RestartCommand::Status => {
            let data = require_daemon(&config, &DaemonRequest::RestartStatus)?;
            if data["scheduled"].as_bool().unwrap_or(false) {
                println!(
                    "restart pending: fires in {}s",
                    data["remaining_seconds"].as_u64().unwrap_or(0)
                );
            } else {
                println!("no restart pending");
            }
        }
    }

    Ok(())
}
