//! `switchyard config`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;

use crate::adapters::providers::AVAILABLE_PROVIDERS;
use crate::cli::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Load and validate the configuration
    Validate,
}

#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_else(|e| format!("failed to render config: {e}"))
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigValidateOutput {
    pub valid: bool,
    pub source: String,
    pub socket_path: String,
    pub provider: String,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        format!(
            "Configuration is valid ({})\n  socket:   {}\n  provider: {} (available: {})",
            self.source,
            self.socket_path,
            self.provider,
            AVAILABLE_PROVIDERS.join(", ")
        )
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: ConfigArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path).context("configuration is invalid")?;
    match args.command {
        ConfigCommand::Show => output(&ConfigShowOutput { config }, json_mode),
        ConfigCommand::Validate => {
            let source = config_path.map_or_else(
                || ".switchyard/ + SWITCHYARD_* environment".to_string(),
                |p| p.display().to_string(),
            );
            output(
                &ConfigValidateOutput {
                    valid: true,
                    source,
                    socket_path: config.daemon.socket_path,
                    provider: config.provider.kind,
                },
                json_mode,
            );
        }
    }
    Ok(())
}
