//! Switchyard CLI entry point.

use std::path::Path;

use clap::Parser;

use switchyard::cli::{commands, handle_error, init_logging, load_config, Cli, Commands};
use switchyard::infrastructure::logging::LoggerImpl;

/// Client commands log warnings only; `serve` sets up the configured logging itself.
fn client_logging(config_path: Option<&Path>) -> Option<LoggerImpl> {
    let config = load_config(config_path).ok()?;
    init_logging(&config, true).ok()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::execute(args, config_path).await,
        Commands::Send(args) => {
            let _logger = client_logging(config_path);
            commands::send::execute(args, config_path, cli.json).await
        }
        Commands::Watch(args) => {
            let _logger = client_logging(config_path);
            commands::watch::execute(args, config_path, cli.json).await
        }
        Commands::Config(args) => commands::config::execute(args, config_path, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
