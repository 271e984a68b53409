//! `tether sync` — trigger a manual sync through the daemon, or run the
//! pipeline in-process with `--local`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use tether_daemon::DaemonRequest;
use tether_sync::{SyncReport, Trigger};

use super::{format_duration_ms, load_config, local_orchestrator, require_daemon};

/// Arguments for `tether sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Run the pipeline in this process instead of asking the daemon.
    /// Never schedules a service restart.
    #[arg(long)]
    pub local: bool,
}

impl SyncArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let config = load_config(config_path)?;

        if self.local {
            let orchestrator = local_orchestrator(config);
            let report = orchestrator
                .run(Trigger::Manual)
                .context("sync failed")?;
            print_report(&report);
            return Ok(());
        }

        let token = config.manual_trigger.token.clone();
        let data = require_daemon(&config, &DaemonRequest::Sync { token })?;
        let sync_id = data["sync_id"].as_str().unwrap_or("-");
        println!(
            "{} sync accepted ({sync_id}); follow it with `tether history`",
            "✓".green().bold()
        );
        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    let apply = &report.apply;
    println!(
        "{} synced '{}' in {} mode ({})",
        "✓".green().bold(),
        report.branch,
        format!("{:?}", report.mode).to_lowercase(),
        format_duration_ms(Some(report.duration_ms)),
    );
    println!(
        "  {} copied, {} unchanged, {} deleted",
        apply.copied, apply.unchanged, apply.deleted
    );
    if apply.skipped > 0 || apply.delete_failed > 0 {
        println!(
            "  {}",
            format!(
                "{} copies skipped, {} deletions failed",
                apply.skipped, apply.delete_failed
            )
            .yellow()
        );
    }
    match &report.backup {
        Some(name) => println!("  backup: {name}"),
        None => println!("  backup: none"),
    }
    if report.pruned > 0 {
        println!("  pruned {} old backup(s)", report.pruned);
    }
}
