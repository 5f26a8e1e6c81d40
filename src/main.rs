//! Statetrait CLI entry point.

use clap::Parser;

use statetrait::cli::{Cli, Commands};
use statetrait::infrastructure::config::ConfigLoader;
use statetrait::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging comes from the project config when it loads; commands that
    // read the config report its errors themselves.
    let log_config = ConfigLoader::load()
        .map(|config| LogConfig::from(&config.logging))
        .unwrap_or_default();
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("warning: logging disabled: {err}");
            None
        }
    };

    let result = match cli.command {
        Commands::Ir(args) => statetrait::cli::commands::ir::execute(args, cli.json).await,
        Commands::Plan(args) => statetrait::cli::commands::plan::execute(args, cli.json).await,
        Commands::Converge(args) => {
            statetrait::cli::commands::converge::execute(args, cli.json).await
        }
        Commands::Config(args) => statetrait::cli::commands::config::execute(args, cli.json).await,
    };

    if let Err(err) = result {
        statetrait::cli::handle_error(err, cli.json);
    }
}
