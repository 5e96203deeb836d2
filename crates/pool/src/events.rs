//! Event broadcasting for pool lifecycle observability.
//!
//! Pools, monitors and scalers emit [`PoolEvent`]s on an [`EventBus`] backed
//! by `tokio::sync::broadcast`.

use std::fmt;
use std::time::Duration;

use resync_resilience::State;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::autoscale::ScalingDecision;
use crate::connection::ConnectionId;
use crate::health::Alert;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted during pool lifecycle operations.
///
/// Every variant names the resource whose pool emitted it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A new connection was opened.
    Created {
        resource: String,
        connection: ConnectionId,
    },
    Acquired {
        resource: String,
        connection: ConnectionId,
        #[serde(with = "humantime_serde")]
        wait: Duration,
        /// Served from the idle set rather than a fresh connection.
        reused: bool,
    },
    Released {
        resource: String,
        connection: ConnectionId,
        #[serde(with = "humantime_serde")]
        held: Duration,
        /// `None` when the lease was dropped without an explicit release.
        healthy: Option<bool>,
    },
    /// A connection was closed and removed for good.
    Destroyed {
        resource: String,
        connection: ConnectionId,
        reason: DestroyReason,
    },
    AcquireFailed { resource: String, error: String },
    /// Every checkout slot was busy; the caller queued.
    Exhausted { resource: String, waiters: usize },
    CircuitChanged {
        resource: String,
        from: State,
        to: State,
    },
    Resized {
        resource: String,
        min_size: usize,
        max_size: usize,
    },
    Scaled {
        resource: String,
        decision: ScalingDecision,
    },
    HealthChecked {
        resource: String,
        evicted: usize,
        replaced: usize,
        probed: usize,
        failed: usize,
    },
    MonitorRestarted { resource: String, restarts: u64 },
    Alert { resource: String, alert: Alert },
}

impl PoolEvent {
    pub fn resource(&self) -> &str {
        match self {
            Self::Created { resource, .. }
            | Self::Acquired { resource, .. }
            | Self::Released { resource, .. }
            | Self::Destroyed { resource, .. }
            | Self::AcquireFailed { resource, .. }
            | Self::Exhausted { resource, .. }
            | Self::CircuitChanged { resource, .. }
            | Self::Resized { resource, .. }
            | Self::Scaled { resource, .. }
            | Self::HealthChecked { resource, .. }
            | Self::MonitorRestarted { resource, .. }
            | Self::Alert { resource, .. } => resource,
        }
    }
}

// ---------------------------------------------------------------------------
// DestroyReason
// ---------------------------------------------------------------------------

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    /// Older than `max_lifetime`.
    Expired,
    /// Idle longer than `idle_timeout`.
    IdleTimeout,
    /// Released with `healthy = false`.
    ReleasedUnhealthy,
    /// Failed the checkout liveness probe.
    LivenessFailed,
    /// Failed the monitor's health probe too many times in a row.
    HealthCheckFailed,
    /// Above the pool's current ceiling after a shrink.
    Shrink,
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expired => "expired",
            Self::IdleTimeout => "idle_timeout",
            Self::ReleasedUnhealthy => "released_unhealthy",
            Self::LivenessFailed => "liveness_failed",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Shrink => "shrink",
            Self::Shutdown => "shutdown",
        })
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus.
///
/// Emission is fire-and-forget: without subscribers, or for a subscriber
/// that lags by more than the buffer, events are dropped.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: PoolEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(PoolEvent::Exhausted {
            resource: "orders-db".to_string(),
            waiters: 3,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(PoolEvent::CircuitChanged {
            resource: "redis".to_string(),
            from: State::Closed,
            to: State::Open,
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.resource(), "redis");
            assert!(matches!(event, PoolEvent::CircuitChanged { to: State::Open, .. }));
        }
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(PoolEvent::Resized {
            resource: "tws".to_string(),
            min_size: 2,
            max_size: 8,
        })
        .unwrap();
        assert_eq!(json["event"], "resized");
        assert_eq!(json["max_size"], 8);
    }
}
