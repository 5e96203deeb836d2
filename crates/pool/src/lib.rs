//! # Resync Pool
//!
//! Connection pools for the services a scheduler dashboard talks to
//! (databases, caches, the workload-automation endpoint), each guarded by a
//! circuit breaker, watched by a health monitor and sized by an auto-scaler.
//!
//! ```no_run
//! use std::time::Duration;
//! use resync_pool::{ManagerConfig, PoolConfig, PoolManager, TcpConnector};
//!
//! # async fn demo() -> resync_pool::Result<()> {
//! let manager = PoolManager::new(ManagerConfig::default())?;
//! manager.register("tws", TcpConnector::new("127.0.0.1:31111"), PoolConfig::default())?;
//! manager.start().await?;
//!
//! let mut conn = manager.acquire::<TcpConnector>("tws", Duration::from_secs(2)).await?;
//! // ... use conn.get_mut()? ...
//! manager.release("tws", &mut conn, true)?;
//!
//! println!("{}", manager.get_health_report().status);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod autoscale;
pub mod config;
pub mod connection;
pub mod connector;
pub mod connectors;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
mod monitor;
pub mod pool;

#[cfg(feature = "metrics")]
pub mod collector;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use autoscale::{AutoScalePolicy, AutoScaler, LoadWeights, ScaleDirection, ScalingDecision};
pub use config::{ManagerConfig, PoolConfig, ResourceKind, ResourceSpec};
pub use connection::{ConnectionHealth, ConnectionId, ConnectionInfo, PooledConnection};
pub use connector::Connector;
pub use connectors::{TcpConnector, register_resource};
pub use error::{BoxError, Error, Result};
pub use events::{DestroyReason, EventBus, PoolEvent};
pub use health::{Alert, AlertKind, AlertThresholds, HealthReport, HealthStatus, ResourceHealth, Severity};
pub use manager::{ManagerState, PoolManager};
pub use crate::metrics::{PoolMetrics, ProbeSummary};
pub use pool::{DrainOutcome, EvictionOutcome, HealthCycle, Pool};

pub use resync_resilience::{CircuitBreakerConfig, RetryConfig, State as CircuitState};

#[cfg(feature = "metrics")]
pub use collector::{MetricsCollector, spawn_metrics_collector};
