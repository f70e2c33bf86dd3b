//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- run the bot
//! - `config show|path` -- inspect configuration
//! - `version` -- print version and platform info

use clap::{Parser, Subcommand};

use crate::config::{self, Config};

/// Telegram delivery bot for short-video share links.
#[derive(Parser, Debug)]
#[command(
    name = "clipferry",
    version = env!("CARGO_PKG_VERSION"),
    about = "Telegram bot that turns TikTok links into delivered media"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bot (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version and platform information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON, token redacted.
    Show,
    /// Print the config file path.
    Path,
}

/// Handle the `config show` subcommand.
///
/// Prints the merged configuration (file values, defaults, environment
/// overrides) so operators can see exactly what the bot would run with.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    println!("{}", serde_json::to_string_pretty(&redacted(&config))?);
    Ok(())
}

/// Handle the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Handle the `version` subcommand.
pub fn handle_version() {
    println!("clipferry {}", env!("CARGO_PKG_VERSION"));
    println!(
        "platform: {}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// Copy of the configuration with the bot token blanked for display.
fn redacted(config: &Config) -> Config {
    let mut copy = config.clone();
    if !copy.telegram.bot_token.is_empty() {
        copy.telegram.bot_token = "[redacted]".to_string();
    }
    copy
}
