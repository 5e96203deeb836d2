use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use resync_pool::{HealthReport, ManagerConfig, PoolManager, register_resource};
use tracing::{info, warn};

/// Build a manager and register every configured resource with its
/// concrete connector.
fn build_manager(config: &ManagerConfig) -> Result<PoolManager> {
    let manager = PoolManager::new(config.clone()).context("failed to create pool manager")?;
    for (name, spec) in &config.resources {
        register_resource(&manager, name, spec)
            .with_context(|| format!("failed to register resource '{name}'"))?;
    }
    Ok(manager)
}

fn render(report: &HealthReport, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    json.context("failed to serialize health report")
}

pub fn check(config: &ManagerConfig, print_config: bool) -> Result<()> {
    // Registration builds every connector, which catches malformed targets.
    build_manager(config)?;

    let mut out = std::io::stdout().lock();
    writeln!(out, "configuration ok: {} resource(s)", config.resources.len())?;
    for (name, spec) in &config.resources {
        let pool = &spec.pool;
        writeln!(
            out,
            "  {name:<20} {:<8} {:<32} min {} max {} hard {}",
            spec.kind.to_string(),
            spec.target,
            pool.min_size,
            pool.max_size,
            pool.hard_ceiling()
        )?;
    }
    writeln!(
        out,
        "autoscale {}, drain grace {:?}",
        if config.autoscale.enabled { "on" } else { "off" },
        config.drain_grace
    )?;

    if print_config {
        let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
        writeln!(out, "\n{rendered}")?;
    }
    Ok(())
}

pub async fn run(config: &ManagerConfig, report_every: Duration) -> Result<()> {
    let manager = build_manager(config)?;

    #[cfg(feature = "metrics")]
    let collector_cancel = tokio_util::sync::CancellationToken::new();
    #[cfg(feature = "metrics")]
    let collector = resync_pool::spawn_metrics_collector(manager.events(), collector_cancel.clone());

    manager.start().await.context("failed to start pool manager")?;
    info!(resources = ?manager.resource_names(), "serving, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(report_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = manager.get_health_report();
                info!(status = %report.status, report = %render(&report, false)?, "health report");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    let outcomes = manager.shutdown().await;
    for (resource, outcome) in &outcomes {
        if outcome.force_closed > 0 {
            warn!(%resource, force_closed = outcome.force_closed, "leases force-closed at shutdown");
        }
    }

    #[cfg(feature = "metrics")]
    {
        collector_cancel.cancel();
        let _ = collector.await;
    }

    println!("{}", render(&manager.get_health_report(), true)?);
    Ok(())
}

pub async fn report(config: &ManagerConfig, compact: bool) -> Result<()> {
    let manager = build_manager(config)?;
    manager.start().await.context("failed to start pool manager")?;
    let report = manager.get_health_report();
    manager.shutdown().await;

    println!("{}", render(&report, !compact)?);
    Ok(())
}
