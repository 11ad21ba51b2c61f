//! depot - Local plugin package manager
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use plugin_depot::cli::{commands, Cli, Commands};
use plugin_depot::config::{Config, ConfigManager};
use plugin_depot::error::DepotResult;
use plugin_depot::Depot;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn, 1 = info, 2+ = debug; RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("plugin_depot=warn"),
        1 => EnvFilter::new("plugin_depot=info"),
        _ => EnvFilter::new("plugin_depot=debug"),
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> DepotResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;
    init_logging(cli.verbose, &config);
    debug!("Loaded configuration from {}", config_manager.path().display());

    // Config commands never touch the plugin directory
    if let Commands::Config(args) = cli.command {
        commands::config(args, &config, &config_manager, cli.json).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let depot = Depot::open(&config, cli.plugin_dir.clone());
    let json = cli.json;

    let ok = match cli.command {
        Commands::Config(_) => true,
        Commands::Install(args) => commands::install(args, &depot, json).await?,
        Commands::Update(args) => commands::update(args, &depot, json).await?,
        Commands::Rollback(args) => commands::rollback(args, &depot, json).await?,
        Commands::Uninstall(args) => commands::uninstall(args, &depot, json).await?,
        Commands::Verify(args) => commands::verify(args, &depot, json).await?,
        Commands::List(args) => commands::list(args, &depot, json).await?,
        Commands::Versions(args) => commands::versions(args, &depot, json).await?,
        Commands::Outdated => commands::outdated(&depot, json).await?,
        Commands::Pin(args) => commands::pin(args, &depot, json).await?,
        Commands::Unpin(args) => commands::unpin(args, &depot, json).await?,
        Commands::Cache(args) => commands::cache(args, &depot, json).await?,
        Commands::Registry(args) => commands::registry(args, &depot, json).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
