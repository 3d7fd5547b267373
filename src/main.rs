//! FIDO Key Seeder CLI
//!
//! Lists, watches and seeds FIDO security keys over USB HID.

use anyhow::Context as _;
use clap::Parser;
use fido_seeder::SeederConfig;
use tracing::debug;

// CLI definitions
mod cli;
use cli::{Cli, Commands};

// Command handlers
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(SeederConfig::default_path);
    let config = SeederConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    fido_seeder::logging::init(&config.log_filter, cli.verbose)?;
    debug!("Using config {}", config_path.display());

    // Create printer config if monitoring is enabled
    let printer_config = commands::create_printer_config(
        cli.monitor,
        cli.hex || config.output.hex,
        cli.filter.as_deref(),
    )?;

    let ctx = commands::Context {
        json: cli.json || config.output.json,
        config,
        config_path,
        printer_config,
    };

    match cli.command {
        Commands::List { all } => commands::list::run(&ctx, all).await?,
        Commands::Watch => commands::watch::run(&ctx).await?,
        Commands::Info { device } => commands::device::info(&ctx, device.as_deref()).await?,
        Commands::Wink { device } => commands::device::wink(&ctx, device.as_deref()).await?,
        Commands::Seed {
            seed,
            ext_state,
            device,
        } => {
            commands::device::seed(&ctx, &seed, ext_state.as_deref(), device.as_deref()).await?
        }
        Commands::Config { init } => commands::config::run(&ctx, init)?,
    }

    Ok(())
}
