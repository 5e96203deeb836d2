//! Per-pool health monitor.
//!
//! Every `health_check_interval` the monitor evicts expired idle
//! connections, probes a sample of the rest, and publishes alerts derived
//! from the fresh metrics. The loop runs under a supervisor that restarts it
//! if it panics.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::events::PoolEvent;
use crate::health::{AlertThresholds, Severity, alerts_for};
use crate::manager::ManagedPool;

/// Upper bound on the pause before a crashed monitor is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Run the monitor until `cancel` fires, restarting it after a panic.
pub(crate) async fn supervise(
    pool: Arc<dyn ManagedPool>,
    thresholds: AlertThresholds,
    cancel: CancellationToken,
) {
    let interval = pool.config().health_check_interval;
    debug!(resource = %pool.name(), ?interval, "health monitor started");

    loop {
        let task = tokio::spawn(run(
            Arc::clone(&pool),
            interval,
            thresholds.clone(),
            cancel.clone(),
        ));
        match task.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                if cancel.is_cancelled() {
                    break;
                }
                let restarts = pool.note_monitor_restart();
                error!(resource = %pool.name(), restarts, "health monitor panicked, restarting");
                pool.events().emit(PoolEvent::MonitorRestarted {
                    resource: pool.name().to_string(),
                    restarts,
                });
                tokio::select! {
                    () = tokio::time::sleep(interval.min(RESTART_DELAY)) => {}
                    () = cancel.cancelled() => break,
                }
            }
            Err(_) => break,
        }
    }
    debug!(resource = %pool.name(), "health monitor stopped");
}

async fn run(
    pool: Arc<dyn ManagedPool>,
    interval: Duration,
    thresholds: AlertThresholds,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => break,
        }

        let cycle = pool.health_cycle().await;
        if cycle.probe.all_failed() {
            warn!(
                resource = %pool.name(),
                probed = cycle.probe.probed,
                "every probed idle connection failed"
            );
        }

        for alert in alerts_for(&pool.metrics(), &thresholds) {
            if alert.severity == Severity::Critical {
                warn!(resource = %pool.name(), kind = ?alert.kind, value = alert.value, "{}", alert.message);
            } else {
                debug!(resource = %pool.name(), kind = ?alert.kind, value = alert.value, "{}", alert.message);
            }
            pool.events().emit(PoolEvent::Alert {
                resource: pool.name().to_string(),
                alert,
            });
        }
    }
}
