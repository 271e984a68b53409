//! `tether backup` — list, pin, delete and roll back to backups.
//!
//! Mutations go through the daemon when it is running so they are ordered
//! with in-flight syncs; otherwise they run in this process.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use tether_core::{BackupName, BackupRef};
use tether_daemon::DaemonRequest;

use super::{format_size, load_config, local_orchestrator, print_json, try_daemon};

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// List backups, newest first.
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Pin a backup so retention never prunes it.
    Protect { name: String },
    /// Remove the pin from a backup.
    Unprotect { name: String },
    /// Delete an unprotected backup.
    Delete { name: String },
    /// Restore the target directory from a backup (newest when omitted).
    /// A safety backup of the current state is taken first.
    Rollback { name: Option<String> },
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "created")]
    created: String,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "protected")]
    protected: String,
}

pub fn run(config_path: Option<&Path>, command: BackupCommand) -> Result<()> {
    let config = load_config(config_path)?;

    match command {
        BackupCommand::List { json } => {
            let backups = local_orchestrator(config)
                .backups()
                .list()
                .context("failed to list backups")?;
            if json {
                return print_json(&backups);
            }
            print_table(backups);
        }
        BackupCommand::Protect { name } => {
            let request = DaemonRequest::ProtectBackup { name: name.clone() };
            if try_daemon(&config, &request)?.is_none() {
                local_orchestrator(config)
                    .backups()
                    .protect(&BackupName::from(name.as_str()))
                    .with_context(|| format!("failed to protect '{name}'"))?;
            }
            println!("{} {name} is protected", "✓".green().bold());
        }
        BackupCommand::Unprotect { name } => {
            let request = DaemonRequest::UnprotectBackup { name: name.clone() };
            if try_daemon(&config, &request)?.is_none() {
                local_orchestrator(config)
                    .backups()
                    .unprotect(&BackupName::from(name.as_str()))
                    .with_context(|| format!("failed to unprotect '{name}'"))?;
            }
            println!("{} {name} is no longer protected", "✓".green().bold());
        }
        BackupCommand::Delete { name } => {
            let request = DaemonRequest::DeleteBackup { name: name.clone() };
            if try_daemon(&config, &request)?.is_none() {
                local_orchestrator(config)
                    .backups()
                    .delete(&BackupName::from(name.as_str()))
                    .with_context(|| format!("failed to delete '{name}'"))?;
            }
            println!("{} deleted {name}", "✓".green().bold());
        }
        BackupCommand::Rollback { name } => {
            let request = DaemonRequest::Rollback {
                backup: name.clone(),
            };
            let (restored, safety) = match try_daemon(&config, &request)? {
                Some(data) => (
                    data["restored"].as_str().unwrap_or("?").to_string(),
                    data["safety_backup"].as_str().unwrap_or("?").to_string(),
                ),
                None => {
                    let name = name.map(BackupName::from);
                    let report = local_orchestrator(config)
                        .rollback(name.as_ref())
                        .context("rollback failed")?;
                    (report.restored.to_string(), report.safety_backup.to_string())
                }
            };
            println!("{} restored {restored}", "✓".green().bold());
            println!("  previous state saved as {safety}");
        }
    }

    Ok(())
}

fn print_table(backups: Vec<BackupRef>) {
    if backups.is_empty() {
        println!("No backups.");
        return;
    }

    let rows: Vec<BackupRow> = backups
        .into_iter()
        .map(|backup| BackupRow {
            name: backup.name.to_string(),
            created: backup
                .created
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            size: format_size(backup.size),
            protected: if backup.protected { "yes" } else { "" }.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
