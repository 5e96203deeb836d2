//! Pool manager: the single entry point callers use.
//!
//! Owns one pool per resource name, runs each pool's health monitor and
//! auto-scaler, and walks the lifecycle
//! `Uninitialized → Starting → Running → Draining → Stopped`.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoscale;
use crate::config::{ManagerConfig, PoolConfig};
use crate::connection::PooledConnection;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent};
use crate::health::{HealthReport, ResourceHealth};
use crate::metrics::PoolMetrics;
use crate::monitor;
use crate::pool::{DrainOutcome, HealthCycle, Pool};

// ---------------------------------------------------------------------------
// ManagerState
// ---------------------------------------------------------------------------

/// Lifecycle of a [`PoolManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ManagerState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

impl ManagerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    /// Draining or stopped.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Draining | Self::Stopped)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

// ---------------------------------------------------------------------------
// Type-erased pool
// ---------------------------------------------------------------------------

/// Object-safe view of a `Pool<C>` so pools of different connector types
/// share one map and one set of background loops.
#[async_trait]
pub(crate) trait ManagedPool: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn config(&self) -> &PoolConfig;
    fn events(&self) -> &Arc<EventBus>;
    fn metrics(&self) -> PoolMetrics;
    fn resize(&self, new_min: usize, new_max: usize) -> Result<()>;
    fn note_monitor_restart(&self) -> u64;
    fn as_any(&self) -> &dyn Any;

    async fn warm_up(&self) -> usize;
    async fn health_cycle(&self) -> HealthCycle;
    async fn drain(&self, grace: Duration) -> DrainOutcome;
}

#[async_trait]
impl<C: Connector> ManagedPool for Pool<C> {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn config(&self) -> &PoolConfig {
        Self::config(self)
    }

    fn events(&self) -> &Arc<EventBus> {
        Self::events(self)
    }

    fn metrics(&self) -> PoolMetrics {
        Self::metrics(self)
    }

    fn resize(&self, new_min: usize, new_max: usize) -> Result<()> {
        Self::resize(self, new_min, new_max)
    }

    fn note_monitor_restart(&self) -> u64 {
        Self::note_monitor_restart(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn warm_up(&self) -> usize {
        Self::warm_up(self).await
    }

    async fn health_cycle(&self) -> HealthCycle {
        Self::health_cycle(self).await
    }

    async fn drain(&self, grace: Duration) -> DrainOutcome {
        Self::drain(self, grace).await
    }
}

struct PoolEntry {
    pool: Arc<dyn ManagedPool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

struct ManagerInner {
    config: ManagerConfig,
    state: AtomicU8,
    pools: DashMap<String, PoolEntry>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    /// Serialises `start` and `shutdown`.
    lifecycle: tokio::sync::Mutex<()>,
    /// Drains of pools replaced by `reconfigure`, awaited by `shutdown`.
    /// Also serialises `reconfigure` against `shutdown` taking the list.
    retired: parking_lot::Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Facade over every resource's pool.
///
/// Cheap to clone; construct one at startup and pass it to whoever needs
/// connections.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("state", &self.state())
            .field("pool_count", &self.inner.pools.len())
            .finish()
    }
}

impl PoolManager {
    /// Create a manager with no pools. The `resources` section of `config`
    /// is not read here; register pools with [`register`](Self::register).
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new(config.event_capacity));
        Ok(Self {
            inner: Arc::new(ManagerInner {
                state: AtomicU8::new(ManagerState::Uninitialized as u8),
                pools: DashMap::new(),
                events,
                cancel: CancellationToken::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                retired: parking_lot::Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ManagerState) {
        self.inner.state.store(state as u8, Ordering::Release);
        debug!(%state, "pool manager state changed");
    }

    /// Registered resource names, sorted.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stream of every pool's events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Add a pool for `name`.
    ///
    /// Before `start` the pool stays cold; once running it is warmed and
    /// monitored immediately.
    pub fn register<C: Connector>(
        &self,
        name: impl Into<String>,
        connector: C,
        config: PoolConfig,
    ) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::NotRunning { state });
        }
        let name = name.into();
        let kind = connector.kind();

        match self.inner.pools.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateResource { resource: name }),
            Entry::Vacant(slot) => {
                // Re-read under the shard lock: `start` flips to Running
                // before it sweeps the map, so either we see Running here or
                // its sweep sees our entry.
                let state = self.state();
                if state.is_terminal() {
                    return Err(Error::NotRunning { state });
                }
                let pool = Pool::with_options(
                    name.clone(),
                    Arc::new(connector),
                    config,
                    self.inner.config.breaker.clone(),
                    Arc::clone(&self.inner.events),
                )?;
                let mut entry = PoolEntry {
                    pool: Arc::new(pool),
                    cancel: self.inner.cancel.child_token(),
                    tasks: Vec::new(),
                };
                if state == ManagerState::Running {
                    self.spawn_background(&mut entry, true);
                }
                slot.insert(entry);
                info!(resource = %name, kind, "resource registered");
                Ok(())
            }
        }
    }

    /// Warm every pool to its `min_size` and start the background loops.
    ///
    /// Warm-up failures are logged; the pools fill up on demand instead.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.state() {
            ManagerState::Uninitialized => {}
            ManagerState::Running => return Ok(()),
            state => return Err(Error::NotRunning { state }),
        }
        self.set_state(ManagerState::Starting);

        let pools = self.snapshot();
        let opened = join_all(pools.iter().map(|(_, pool)| pool.warm_up())).await;
        for ((name, pool), opened) in pools.iter().zip(opened) {
            let min_size = pool.config().min_size;
            if opened < min_size {
                warn!(resource = %name, opened, min_size, "pool started below min_size");
            }
        }

        // Flip first, then sweep: a pool registered meanwhile either saw
        // Running and started its own tasks, or is picked up here.
        self.set_state(ManagerState::Running);
        let warmed: HashSet<&str> = pools.iter().map(|(name, _)| name.as_str()).collect();
        self.start_idle_pools(&warmed);
        info!(pools = self.inner.pools.len(), "pool manager running");
        Ok(())
    }

    /// Check out a connection from `name`'s pool.
    pub async fn acquire<C: Connector>(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<PooledConnection<C>> {
        match self.state() {
            ManagerState::Running => {}
            state if state.is_terminal() => return Err(Error::shutting_down(name)),
            state => return Err(Error::NotRunning { state }),
        }
        self.pool::<C>(name)?.acquire(timeout).await
    }

    /// Hand a lease back to `name`'s pool.
    ///
    /// Once draining, the connection is still taken back (so counts stay
    /// right) but the call reports [`Error::ShuttingDown`].
    pub fn release<C: Connector>(
        &self,
        name: &str,
        conn: &mut PooledConnection<C>,
        healthy: bool,
    ) -> Result<()> {
        if conn.resource() != name {
            return Err(Error::ForeignConnection {
                expected: name.to_string(),
                actual: conn.resource().to_string(),
            });
        }
        let outcome = conn.release(healthy);
        if self.state().is_terminal() {
            return outcome.and(Err(Error::shutting_down(name)));
        }
        outcome
    }

    /// Typed handle to `name`'s current pool.
    pub fn pool<C: Connector>(&self, name: &str) -> Result<Pool<C>> {
        let entry = self
            .inner
            .pools
            .get(name)
            .ok_or_else(|| Error::UnknownResource {
                resource: name.to_string(),
            })?;
        entry
            .pool
            .as_any()
            .downcast_ref::<Pool<C>>()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch {
                resource: name.to_string(),
                registered: entry.pool.type_name(),
                requested: std::any::type_name::<C>(),
            })
    }

    pub fn get_metrics(&self, name: &str) -> Result<PoolMetrics> {
        self.inner
            .pools
            .get(name)
            .map(|entry| entry.pool.metrics())
            .ok_or_else(|| Error::UnknownResource {
                resource: name.to_string(),
            })
    }

    /// `{name: health}` for every resource.
    pub fn get_health_report(&self) -> HealthReport {
        let thresholds = &self.inner.config.alerts;
        let resources: BTreeMap<String, ResourceHealth> = self
            .snapshot()
            .into_iter()
            .map(|(name, pool)| {
                let health = ResourceHealth::assess(&pool.metrics(), thresholds);
                (name, health)
            })
            .collect();
        HealthReport::new(self.state(), resources)
    }

    /// Replace `name`'s pool with a new one built from `config`.
    ///
    /// The new pool starts with fresh metrics and the same connector. The old
    /// pool drains in the background; its outstanding leases return to it.
    pub fn reconfigure<C: Connector>(&self, name: &str, config: PoolConfig) -> Result<()> {
        let mut retired = self.inner.retired.lock();
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::NotRunning { state });
        }
        let old = self.pool::<C>(name)?;
        let pool = Pool::with_options(
            name,
            Arc::clone(old.connector()),
            config,
            self.inner.config.breaker.clone(),
            Arc::clone(&self.inner.events),
        )?;

        let mut entry = PoolEntry {
            pool: Arc::new(pool),
            cancel: self.inner.cancel.child_token(),
            tasks: Vec::new(),
        };
        if state == ManagerState::Running {
            self.spawn_background(&mut entry, true);
        }
        let Some(previous) = self.inner.pools.insert(name.to_string(), entry) else {
            return Err(Error::UnknownResource {
                resource: name.to_string(),
            });
        };
        previous.cancel.cancel();

        let grace = self.inner.config.drain_grace;
        let drain = async move {
            join_all(previous.tasks).await;
            let outcome = previous.pool.drain(grace).await;
            debug!(
                resource = %previous.pool.name(),
                closed_idle = outcome.closed_idle,
                force_closed = outcome.force_closed,
                "replaced pool drained"
            );
        };
        // Without a runtime the old pool drains during `shutdown` instead.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(drain);
                retired.push(
                    async move {
                        let _ = task.await;
                    }
                    .boxed(),
                );
            }
            Err(_) => retired.push(drain.boxed()),
        }
        drop(retired);
        info!(resource = %name, "pool reconfigured");
        Ok(())
    }

    /// Stop every background loop and drain every pool.
    ///
    /// Waits up to `drain_grace` for leases to come back, then force-closes
    /// them. Idempotent.
    pub async fn shutdown(&self) -> BTreeMap<String, DrainOutcome> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == ManagerState::Stopped {
            return BTreeMap::new();
        }
        self.set_state(ManagerState::Draining);
        info!("pool manager draining");

        self.inner.cancel.cancel();
        let mut tasks = Vec::new();
        for mut entry in self.inner.pools.iter_mut() {
            tasks.append(&mut entry.value_mut().tasks);
        }
        join_all(tasks).await;

        let grace = self.inner.config.drain_grace;
        let retired = std::mem::take(&mut *self.inner.retired.lock());
        let pools = self.snapshot();
        let (outcomes, _) = futures::join!(
            join_all(pools.iter().map(|(name, pool)| async move {
                (name.clone(), pool.drain(grace).await)
            })),
            join_all(retired),
        );

        self.set_state(ManagerState::Stopped);
        let forced: usize = outcomes.iter().map(|(_, o)| o.force_closed).sum();
        info!(pools = outcomes.len(), force_closed = forced, "pool manager stopped");
        outcomes.into_iter().collect()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn ManagedPool>)> {
        self.inner
            .pools
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.value().pool)))
            .collect()
    }

    /// Start background tasks for every pool that has none yet, warming the
    /// ones not in `warmed`.
    fn start_idle_pools(&self, warmed: &HashSet<&str>) {
        for mut entry in self.inner.pools.iter_mut() {
            if entry.value().tasks.is_empty() {
                let warm = !warmed.contains(entry.key().as_str());
                self.spawn_background(entry.value_mut(), warm);
            }
        }
    }

    fn spawn_background(&self, entry: &mut PoolEntry, warm: bool) {
        let pool = &entry.pool;
        if warm {
            let pool = Arc::clone(pool);
            entry.tasks.push(tokio::spawn(async move {
                pool.warm_up().await;
            }));
        }
        entry.tasks.push(tokio::spawn(monitor::supervise(
            Arc::clone(pool),
            self.inner.config.alerts.clone(),
            entry.cancel.clone(),
        )));
        if self.inner.config.autoscale.enabled {
            entry.tasks.push(tokio::spawn(autoscale::run(
                Arc::clone(pool),
                self.inner.config.autoscale.clone(),
                entry.cancel.clone(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockConnection};
    use pretty_assertions::assert_eq;

    fn small() -> PoolConfig {
        PoolConfig::default().with_size(1, 3)
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ManagerState::Uninitialized,
            ManagerState::Starting,
            ManagerState::Running,
            ManagerState::Draining,
            ManagerState::Stopped,
        ] {
            assert_eq!(ManagerState::from_u8(state as u8), state);
        }
        assert_eq!(ManagerState::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn acquire_before_start_is_rejected() {
        let manager = PoolManager::new(ManagerConfig::default()).unwrap();
        manager.register("db", MockConnector::new(), small()).unwrap();

        let err = manager
            .acquire::<MockConnector>("db", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotRunning {
                state: ManagerState::Uninitialized
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_resources() {
        let manager = PoolManager::new(ManagerConfig::default()).unwrap();
        manager.register("db", MockConnector::new(), small()).unwrap();
        assert!(matches!(
            manager.register("db", MockConnector::new(), small()),
            Err(Error::DuplicateResource { .. })
        ));
        assert!(matches!(
            manager.get_metrics("cache"),
            Err(Error::UnknownResource { .. })
        ));
        assert_eq!(manager.resource_names(), vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn typed_lookup_checks_connector_type() {
        struct Other;
        impl Connector for Other {
            type Connection = MockConnection;
            async fn connect(&self) -> std::result::Result<MockConnection, crate::BoxError> {
                Err("never".into())
            }
        }

        let manager = PoolManager::new(ManagerConfig::default()).unwrap();
        manager.register("db", MockConnector::new(), small()).unwrap();
        let err = manager.pool::<Other>("db").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn pool_registered_while_starting_gets_its_tasks() {
        let mut config = ManagerConfig::default();
        config.autoscale.enabled = false;
        let manager = PoolManager::new(config).unwrap();
        let connector = MockConnector::new();

        // Registered after `start` took its snapshot, before Running.
        manager.set_state(ManagerState::Starting);
        manager.register("late", connector.clone(), small()).unwrap();
        assert!(manager.inner.pools.get("late").unwrap().tasks.is_empty());

        manager.set_state(ManagerState::Running);
        manager.start_idle_pools(&HashSet::new());
        manager.start_idle_pools(&HashSet::new());
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Warm-up plus monitor, spawned once.
        assert_eq!(manager.inner.pools.get("late").unwrap().tasks.len(), 2);
        assert_eq!(connector.connects(), 1);
        manager.shutdown().await;
    }

    #[test]
    fn reconfigure_without_runtime_drains_on_shutdown() {
        let manager = PoolManager::new(ManagerConfig::default()).unwrap();
        manager.register("db", MockConnector::new(), small()).unwrap();
        manager
            .reconfigure::<MockConnector>("db", PoolConfig::default().with_size(0, 5))
            .unwrap();
        assert_eq!(manager.inner.retired.lock().len(), 1);
        assert_eq!(manager.get_metrics("db").unwrap().max_size, 5);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(manager.shutdown());
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(manager.inner.retired.lock().is_empty());

        assert!(matches!(
            manager.reconfigure::<MockConnector>("db", small()),
            Err(Error::NotRunning {
                state: ManagerState::Stopped
            })
        ));
    }
}
