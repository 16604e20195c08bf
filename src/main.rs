//! Strata - incremental image builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::args::{ConfigAction, ConfigArgs};
use strata::cli::{Cli, Commands};
use strata::config::{Config, ConfigManager};
use strata::error::StrataResult;
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

async fn run() -> StrataResult<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    // `config init` must work when the existing file is the problem
    let config = match &cli.command {
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Init { .. }),
        }) => Config::default(),
        _ => config_manager.load().await?,
    };

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
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
    debug!("Loaded configuration from {}", config_manager.path().display());

    let store_root = cli
        .store
        .clone()
        .unwrap_or_else(|| config.store.resolved_root());

    match cli.command {
        Commands::Build(args) => strata::cli::commands::build(args, &config, &store_root).await,
        Commands::Import(args) => strata::cli::commands::import(args, &store_root).await,
        Commands::Images(args) => strata::cli::commands::images(args, &store_root).await,
        Commands::Inspect(args) => strata::cli::commands::inspect(args, &store_root).await,
        Commands::Prune => strata::cli::commands::prune(&store_root).await,
        Commands::Config(args) => {
            strata::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
