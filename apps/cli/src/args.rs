use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use resync_log::Format;

/// resync-poolctl - run and inspect resync connection pools
#[derive(Parser, Debug)]
#[command(name = "resync-poolctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pool configuration file (TOML)
    #[arg(short, long, global = true, env = "RESYNC_POOL_CONFIG", default_value = "pools.toml")]
    pub config: PathBuf,

    /// Log filter directive (e.g. `info`, `resync_pool=debug`)
    #[arg(long, global = true, env = "RESYNC_LOG")]
    pub log_level: Option<String>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, env = "RESYNC_LOG_FORMAT")]
    pub log_format: Option<Format>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load and validate the configuration, then print a summary
    Check {
        /// Also print the effective configuration after layering
        #[arg(long)]
        print_config: bool,
    },

    /// Start the manager and serve until Ctrl-C
    Run {
        /// How often to log the health report
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        report_every: Duration,
    },

    /// Start the manager, warm every pool, print one health report and stop
    Report {
        /// Single-line JSON instead of pretty-printed
        #[arg(long)]
        compact: bool,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}
