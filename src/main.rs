//! Envspace - shared environment space cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use envspace::cli::{Cli, Commands};
use envspace::config::ConfigManager;
use envspace::error::SpaceResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> SpaceResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let mut config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("envspace=warn"),
        1 => EnvFilter::new("envspace=info"),
        _ => EnvFilter::new("envspace=debug"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }

    if let Some(base_dir) = cli.base_dir {
        debug!("Using spaces directory {}", base_dir.display());
        config.pool.base_dir = Some(base_dir);
    }

    match cli.command {
        Commands::List(args) => envspace::cli::commands::list(args, &config).await,
        Commands::Allocate(args) => envspace::cli::commands::allocate(args, &config).await,
        Commands::Repair(args) => envspace::cli::commands::repair(args, &config).await,
        Commands::Prune(args) => envspace::cli::commands::prune(args, &config).await,
        Commands::Config(args) => {
            envspace::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
