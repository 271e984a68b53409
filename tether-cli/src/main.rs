//! tether — pull a git branch into a live configuration directory.
//!
//! # Usage
//!
//! ```text
//! tether [--config <path>] daemon start|stop|status
//! tether sync [--local]
//! tether history [--limit <n>] [--json] [--clear]
//! tether stats
//! tether backup list|protect|unprotect|delete|rollback
//! tether restart schedule [--delay <secs>]|cancel|status
//! tether config show
//! tether health
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    backup::BackupCommand, config::ConfigCommand, daemon::DaemonCommand, history::HistoryArgs,
    restart::RestartCommand, sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Keep a configuration directory in sync with a git branch",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.tether/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Trigger a manual sync.
    Sync(SyncArgs),

    /// Show (or clear) the sync history.
    History(HistoryArgs),

    /// Summarise the sync history.
    Stats,

    /// Inspect and manage backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },

    /// Control the delayed service restart.
    Restart {
        #[command(subcommand)]
        command: RestartCommand,
    },

    /// Inspect the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Check that the daemon is answering.
    Health,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(config_path, command),
        Commands::Sync(args) => args.run(config_path),
        Commands::History(args) => args.run(config_path),
        Commands::Stats => commands::history::stats(config_path),
        Commands::Backup { command } => commands::backup::run(config_path, command),
        Commands::Restart { command } => commands::restart::run(config_path, command),
        Commands::Config { command } => commands::config::run(config_path, command),
        Commands::Health => commands::daemon::health(config_path),
    }
}
