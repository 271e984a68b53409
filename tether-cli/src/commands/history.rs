//! `tether history` and `tether stats`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use tether_core::{SyncEntry, SyncStatus};
use tether_daemon::DaemonRequest;

use super::{format_duration_ms, load_config, local_orchestrator, print_json, try_daemon};

/// Arguments for `tether history`.
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Show at most this many entries (newest first).
    #[arg(long)]
    pub limit: Option<usize>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Delete every history entry.
    #[arg(long, conflicts_with_all = ["limit", "json"])]
    pub clear: bool,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "when")]
    when: String,
    #[tabled(rename = "type")]
    sync_type: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "commits")]
    commits: u32,
    #[tabled(rename = "took")]
    took: String,
    #[tabled(rename = "detail")]
    detail: String,
}

impl HistoryArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let config = load_config(config_path)?;

        if self.clear {
            // The daemon owns the ledger while it runs.
            if try_daemon(&config, &DaemonRequest::ClearHistory)?.is_none() {
                local_orchestrator(config)
                    .history()
                    .clear()
                    .context("failed to clear history")?;
            }
            println!("history cleared");
            return Ok(());
        }

        let entries = local_orchestrator(config)
            .history()
            .list(self.limit)
            .context("failed to read history")?;
        if self.json {
            return print_json(&entries);
        }
        print_table(entries);
        Ok(())
    }
}

fn print_table(entries: Vec<SyncEntry>) {
    if entries.is_empty() {
        println!("No syncs recorded.");
        return;
    }

    let rows: Vec<HistoryRow> = entries
        .into_iter()
        .map(|entry| HistoryRow {
            when: entry
                .timestamp
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            sync_type: entry.sync_type.to_string(),
            status: entry.status.to_string(),
            branch: entry.branch,
            commits: entry.commits,
            took: format_duration_ms(entry.duration_ms),
            detail: match entry.status {
                SyncStatus::Failed => entry.error.unwrap_or_default(),
                _ => entry.message.unwrap_or_default(),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

pub fn stats(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let stats = local_orchestrator(config)
        .history()
        .stats()
        .context("failed to read history")?;

    println!("{} syncs recorded", stats.total.to_string().bold());
    println!("  {} {}", "succeeded:".green(), stats.success);
    println!("  {} {}", "failed:   ".red(), stats.failed);
    if stats.in_progress > 0 {
        println!("  {} {}", "running:  ".yellow(), stats.in_progress);
    }
    println!(
        "  average duration: {}",
        format_duration_ms(stats.average_duration_ms)
    );
    Ok(())
}
