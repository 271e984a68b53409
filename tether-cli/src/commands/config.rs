//! `tether config show`.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use super::{load_config, print_json};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets masked.
    Show,
}

pub fn run(config_path: Option<&Path>, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = load_config(config_path)?;
            print_json(&config.redacted())
        }
    }
}
