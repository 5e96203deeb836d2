//! Logging setup shared by the resync crates and the `resync-poolctl` binary.
//!
//! Library code only ever emits through `tracing` macros; this crate decides
//! where those events go. Call [`init`] once from `main` and keep the returned
//! [`LoggerGuard`] alive for the lifetime of the process.
//!
//! ```no_run
//! let _guard = resync_log::init(resync_log::Config::from_env())?;
//! tracing::info!(resource = "orders-db", "pool started");
//! # Ok::<(), resync_log::LogError>(())
//! ```

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Format};
pub use error::{LogError, LogResult};

/// Install the global subscriber described by `config`.
pub fn init(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test: only the first call in a process installs
/// anything, later calls are no-ops.
pub fn init_test() {
    let filter = std::env::var("RESYNC_LOG").unwrap_or_else(|_| "debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_test_writer()
        .with_target(false)
        .compact()
        .try_init();
}
