//! `resync-poolctl`: validate pool configuration, run a pool manager, print
//! health reports.

use anyhow::{Context, Result};
use clap::Parser;

mod args;
mod commands;
mod config;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log = resync_log::Config::from_env();
    if let Some(level) = &cli.log_level {
        log = log.with_level(level);
    }
    if let Some(format) = cli.log_format {
        log = log.with_format(format);
    }
    let _guard = resync_log::init(log.with_service("resync-poolctl"))
        .context("failed to initialise logging")?;

    let config = config::load(&cli.config)?;
    match cli.command {
        Commands::Check { print_config } => commands::check(&config, print_config),
        Commands::Run { report_every } => commands::run(&config, report_every).await,
        Commands::Report { compact } => commands::report(&config, compact).await,
    }
}
