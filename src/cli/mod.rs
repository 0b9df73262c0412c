//! Command-line interface.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};

use commands::config::ConfigArgs;
use commands::send::SendArgs;
use commands::serve::ServeArgs;
use commands::watch::WatchArgs;

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "Event routing and completion coordination daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Load configuration from this file instead of .switchyard/
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon
    Serve(ServeArgs),
    /// Send one event to a running daemon and print the response
    Send(SendArgs),
    /// Stream events matching patterns from a running daemon
    Watch(WatchArgs),
    /// Inspect configuration
    Config(ConfigArgs),
}

/// Load configuration from an explicit file or the default layers.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Initialize logging; client commands only log warnings.
pub fn init_logging(config: &Config, client: bool) -> Result<LoggerImpl> {
    let mut log_config = LogConfig::from_settings(&config.logging)?;
    if client {
        log_config.level = "warn".to_string();
        log_config.log_dir = None;
    }
    LoggerImpl::init(&log_config)
}

/// Print an error and exit with a non-zero status.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        println!(
            "{}",
            serde_json::json!({
                "success": false,
                "error": err.to_string(),
                "caused_by": chain,
            })
        );
    } else {
        eprintln!("Error: {err}");
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1);
}
