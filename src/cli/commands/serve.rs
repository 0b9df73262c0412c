//! `switchyard serve`.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::application::Daemon;
use crate::cli::{init_logging, load_config};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path (overrides daemon.socket_path)
    #[arg(short, long)]
    pub socket: Option<String>,

    /// Use the mock provider instead of the configured one
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(socket) = args.socket {
        config.daemon.socket_path = socket;
    }
    let _logger = init_logging(&config, false)?;

    let daemon = if args.dry_run {
        info!("dry run: completions are served by the mock provider");
        Daemon::dry_run(config).await?
    } else {
        Daemon::new(config).await?
    };
    daemon.run().await
}
