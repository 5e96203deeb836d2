//! Export of pool events through the `metrics` crate.
//!
//! Gated behind the `metrics` feature.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::{EventBus, PoolEvent};

/// Subscribes to an [`EventBus`] and records counters and histograms, each
/// labelled with the resource name.
pub struct MetricsCollector {
    receiver: broadcast::Receiver<PoolEvent>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(events: &EventBus) -> Self {
        Self {
            receiver: events.subscribe(),
        }
    }

    /// Consume events until `cancel` fires or the bus is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                result = self.receiver.recv() => match result {
                    Ok(event) => record(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "metrics collector lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = cancel.cancelled() => break,
            }
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish()
    }
}

fn record(event: &PoolEvent) {
    let resource = event.resource().to_string();
    match event {
        PoolEvent::Created { .. } => {
            metrics::counter!("pool.connections.created", "resource" => resource).increment(1);
        }
        PoolEvent::Acquired { wait, reused, .. } => {
            let source = if *reused { "idle" } else { "new" };
            metrics::counter!("pool.acquire.total", "resource" => resource.clone(), "source" => source)
                .increment(1);
            metrics::histogram!("pool.acquire.wait_seconds", "resource" => resource)
                .record(wait.as_secs_f64());
        }
        PoolEvent::Released { held, .. } => {
            metrics::histogram!("pool.lease.held_seconds", "resource" => resource)
                .record(held.as_secs_f64());
        }
        PoolEvent::Destroyed { reason, .. } => {
            metrics::counter!(
                "pool.connections.destroyed",
                "resource" => resource,
                "reason" => reason.to_string()
            )
            .increment(1);
        }
        PoolEvent::AcquireFailed { .. } => {
            metrics::counter!("pool.acquire.errors", "resource" => resource).increment(1);
        }
        PoolEvent::Exhausted { waiters, .. } => {
            metrics::counter!("pool.exhausted.total", "resource" => resource.clone()).increment(1);
            metrics::gauge!("pool.waiters", "resource" => resource).set(*waiters as f64);
        }
        PoolEvent::CircuitChanged { to, .. } => {
            metrics::counter!(
                "pool.circuit.transitions",
                "resource" => resource,
                "to" => to.to_string()
            )
            .increment(1);
        }
        PoolEvent::Resized { max_size, .. } => {
            metrics::gauge!("pool.max_size", "resource" => resource).set(*max_size as f64);
        }
        PoolEvent::HealthChecked { failed, .. } => {
            metrics::counter!("pool.probe.failures", "resource" => resource).increment(*failed as u64);
        }
        PoolEvent::MonitorRestarted { .. } => {
            metrics::counter!("pool.monitor.restarts", "resource" => resource).increment(1);
        }
        // Scaling shows up as `Resized`; alerts are for humans.
        PoolEvent::Scaled { .. } | PoolEvent::Alert { .. } => {}
    }
}

/// Create a [`MetricsCollector`] and spawn it.
pub fn spawn_metrics_collector(
    events: &Arc<EventBus>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(MetricsCollector::new(events).run(cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stops_on_cancel_after_recording() {
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let handle = spawn_metrics_collector(&bus, cancel.clone());

        bus.emit(PoolEvent::Exhausted {
            resource: "db".to_string(),
            waiters: 2,
        });
        bus.emit(PoolEvent::AcquireFailed {
            resource: "db".to_string(),
            error: "timed out".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("collector should stop")
            .unwrap();
    }
}
