//! Connection pool: a bounded set of homogeneous connections for one resource.
//!
//! Checkout slots are semaphore permits, so callers queue in FIFO order and a
//! cancelled acquire leaves the queue without consuming a slot. The idle set,
//! counters and dynamic bounds live in one `parking_lot::Mutex` that is only
//! held for bookkeeping, never across an `.await`.
//!
//! Idle connections are a stack: checkout takes the most recently used one,
//! so cold connections drift to the front where eviction and probing look.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use resync_resilience::{Admission, CircuitBreaker, CircuitBreakerConfig, RetryError, State, retry};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionHealth, ConnectionInfo, PooledConnection, Slot};
use crate::connector::Connector;
use crate::error::{BoxError, Error, Result};
use crate::events::{DestroyReason, EventBus, PoolEvent};
use crate::metrics::{PoolMetrics, ProbeSummary, Stats};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one `evict_idle` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionOutcome {
    /// Idle connections closed (expired, idle too long, or above the ceiling).
    pub evicted: usize,
    /// Connections opened to get back to `min_size`.
    pub replaced: usize,
}

/// Result of one health-monitor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCycle {
    pub eviction: EvictionOutcome,
    pub probe: ProbeSummary,
}

/// Result of draining a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    pub closed_idle: usize,
    /// Leases still out when the grace period ended.
    pub force_closed: usize,
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

struct PoolState<T> {
    idle: VecDeque<Slot<T>>,
    active: usize,
    /// Connections outside the idle set but not lent: being opened, or
    /// taken out for a probe.
    pending: usize,
    min_size: usize,
    max_size: usize,
    /// Permits still to be retired after a shrink that found them lent out.
    shrink_debt: usize,
    waiters: usize,
    closing: bool,
    stats: Stats,
}

impl<T> PoolState<T> {
    fn size(&self) -> usize {
        self.active + self.idle.len()
    }

    fn occupied(&self) -> usize {
        self.active + self.idle.len() + self.pending
    }
}

pub(crate) struct PoolInner<C: Connector> {
    name: String,
    connector: Arc<C>,
    config: PoolConfig,
    breaker: CircuitBreaker,
    events: Arc<EventBus>,
    state: Mutex<PoolState<C::Connection>>,
    permits: Arc<Semaphore>,
    /// Signalled whenever capacity frees up or the active count drops.
    changed: Notify,
    force_closed: AtomicBool,
}

enum Next<T> {
    Idle(Slot<T>),
    Create,
    Wait,
}

// ---------------------------------------------------------------------------
// Pool<C>
// ---------------------------------------------------------------------------

/// Generic connection pool.
///
/// Cheap to clone; clones share the same pool.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, idle, max_size) = {
            let st = self.inner.state.lock();
            (st.active, st.idle.len(), st.max_size)
        };
        f.debug_struct("Pool")
            .field("resource", &self.inner.name)
            .field("kind", &self.inner.connector.kind())
            .field("active", &active)
            .field("idle", &idle)
            .field("max_size", &max_size)
            .field("circuit", &self.inner.breaker.state())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool with a default breaker and its own event bus.
    ///
    /// No connection is opened until the first acquire or [`warm_up`](Self::warm_up).
    pub fn new(name: impl Into<String>, connector: C, config: PoolConfig) -> Result<Self> {
        Self::with_options(
            name,
            Arc::new(connector),
            config,
            CircuitBreakerConfig::default(),
            Arc::new(EventBus::default()),
        )
    }

    /// Create a pool sharing a connector and an event bus with others.
    pub fn with_options(
        name: impl Into<String>,
        connector: Arc<C>,
        config: PoolConfig,
        breaker: CircuitBreakerConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        let bus = Arc::clone(&events);
        let breaker = CircuitBreaker::new(name.clone(), breaker)?.with_listener(Arc::new(
            move |t: &resync_resilience::Transition| {
                bus.emit(PoolEvent::CircuitChanged {
                    resource: t.breaker.clone(),
                    from: t.from,
                    to: t.to,
                });
            },
        ));

        let max = config.max_size;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                breaker,
                events,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max),
                    active: 0,
                    pending: 0,
                    min_size: config.min_size,
                    max_size: max,
                    shrink_debt: 0,
                    waiters: 0,
                    closing: false,
                    stats: Stats::default(),
                }),
                permits: Arc::new(Semaphore::new(max)),
                changed: Notify::new(),
                force_closed: AtomicBool::new(false),
                config,
                name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.inner.connector
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Current `(min_size, max_size)`.
    pub fn bounds(&self) -> (usize, usize) {
        let st = self.inner.state.lock();
        (st.min_size, st.max_size)
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// Serves the most recently used idle connection that passes the cheap
    /// liveness probe; otherwise opens a new one while below the ceiling;
    /// otherwise queues behind earlier callers.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<C>> {
        let inner = &self.inner;
        let started = Instant::now();

        if inner.state.lock().closing {
            return Err(Error::shutting_down(&inner.name));
        }

        let admission = inner.breaker.try_acquire();
        if let Admission::Rejected { state, retry_after } = admission {
            let err = {
                let mut st = inner.state.lock();
                st.stats.circuit_rejections += 1;
                Error::CircuitOpen {
                    resource: inner.name.clone(),
                    pool_size: st.size(),
                    max_size: st.max_size,
                    circuit_state: state,
                    retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                }
            };
            debug!(resource = %inner.name, circuit = %state, "acquire rejected by circuit breaker");
            inner.emit_failed(&err);
            return Err(err);
        }

        let mut trial = TrialGuard {
            breaker: &inner.breaker,
            generation: match admission {
                Admission::Trial { generation } => Some(generation),
                _ => None,
            },
        };
        inner.state.lock().stats.attempts += 1;
        inner.checkout(started, timeout, &mut trial).await
    }

    /// Hand a lease back; see [`PooledConnection::release`].
    pub fn release(&self, conn: &mut PooledConnection<C>, healthy: bool) -> Result<()> {
        if !Arc::ptr_eq(conn.pool(), &self.inner) {
            return Err(Error::ForeignConnection {
                expected: self.inner.name.clone(),
                actual: conn.resource().to_string(),
            });
        }
        conn.release(healthy)
    }

    /// Snapshot of the pool's statistics.
    pub fn metrics(&self) -> PoolMetrics {
        let inner = &self.inner;
        let st = inner.state.lock();
        let (avg_wait_ms, p95_wait_ms, max_wait_ms) = st.stats.wait_summary();
        PoolMetrics {
            resource: inner.name.clone(),
            active: st.active,
            idle: st.idle.len(),
            waiters: st.waiters,
            min_size: st.min_size,
            max_size: st.max_size,
            hard_max_size: inner.config.hard_ceiling(),
            circuit_state: inner.breaker.state(),
            acquisition_attempts: st.stats.attempts,
            successful_acquisitions: st.stats.successes,
            acquisition_errors: st.stats.errors,
            timeouts: st.stats.timeouts,
            circuit_rejections: st.stats.circuit_rejections,
            total_created: st.stats.created,
            total_destroyed: st.stats.destroyed,
            pool_hits: st.stats.hits,
            pool_misses: st.stats.misses,
            exhaustions: st.stats.exhaustions,
            peak_active: st.stats.peak_active,
            avg_wait_ms,
            p95_wait_ms,
            max_wait_ms,
            error_rate: st.stats.error_rate(),
            last_health_check: st.stats.last_health_check,
            last_probe: st.stats.last_probe,
            monitor_restarts: st.stats.monitor_restarts,
        }
    }

    /// Open connections until `active + idle` reaches `min_size`.
    ///
    /// Returns how many were opened; failures are logged and stop the pass.
    pub async fn warm_up(&self) -> usize {
        let reserved = self.inner.reserve_deficit();
        self.inner.replenish(reserved).await
    }

    /// Close idle connections past `idle_timeout` or `max_lifetime` (and any
    /// above the current ceiling), then refill to `min_size`.
    pub async fn evict_idle(&self) -> EvictionOutcome {
        let inner = &self.inner;
        let now = Instant::now();
        let doomed = {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            if st.closing {
                return EvictionOutcome::default();
            }
            let mut doomed = Vec::new();
            let mut kept = VecDeque::with_capacity(st.idle.len());
            for slot in st.idle.drain(..) {
                match inner.expiry(&slot.info, now) {
                    Some(reason) => doomed.push((slot, reason)),
                    None => kept.push_back(slot),
                }
            }
            st.idle = kept;
            while st.occupied() > st.max_size {
                match st.idle.pop_front() {
                    Some(slot) => doomed.push((slot, DestroyReason::Shrink)),
                    None => break,
                }
            }
            st.stats.destroyed += doomed.len() as u64;
            doomed
        };

        let evicted = doomed.len();
        if evicted > 0 {
            debug!(resource = %inner.name, evicted, "evicting idle connections");
        }
        inner.close_now(doomed).await;

        let reserved = inner.reserve_deficit();
        let replaced = inner.replenish(reserved).await;
        EvictionOutcome { evicted, replaced }
    }

    /// Run the deep health probe on up to `probe_sample` of the coldest idle
    /// connections.
    ///
    /// The connections are taken out of the idle set for the duration of the
    /// probe and put back afterwards, so the lock is never held while probing.
    /// Every outcome is reported to the circuit breaker.
    pub async fn probe_idle(&self) -> ProbeSummary {
        let inner = &self.inner;
        let batch: Vec<Slot<C::Connection>> = {
            let mut st = inner.state.lock();
            if st.closing {
                return ProbeSummary {
                    probed: 0,
                    failed: 0,
                };
            }
            let n = inner.config.probe_sample.min(st.idle.len());
            let batch: Vec<_> = st.idle.drain(..n).collect();
            st.pending += batch.len();
            batch
        };
        let mut pending = PendingGuard {
            inner,
            count: batch.len(),
        };

        let mut summary = ProbeSummary {
            probed: batch.len(),
            failed: 0,
        };
        let mut survivors = Vec::with_capacity(batch.len());
        let mut doomed = Vec::new();
        for mut slot in batch {
            let probe = tokio::time::timeout(
                inner.config.probe_timeout,
                inner.connector.health_check(&mut slot.conn),
            )
            .await;
            match probe {
                Ok(Ok(())) => {
                    slot.info.consecutive_errors = 0;
                    slot.info.health = ConnectionHealth::Healthy;
                    inner.breaker.record_success();
                    survivors.push(slot);
                }
                outcome => {
                    summary.failed += 1;
                    slot.info.consecutive_errors += 1;
                    slot.info.health = ConnectionHealth::Unhealthy;
                    inner.breaker.record_failure();
                    let error = match outcome {
                        Ok(Err(e)) => e.to_string(),
                        _ => "probe timed out".to_string(),
                    };
                    debug!(
                        resource = %inner.name,
                        connection = %slot.info.id,
                        consecutive_errors = slot.info.consecutive_errors,
                        %error,
                        "idle connection failed health probe"
                    );
                    if slot.info.consecutive_errors >= inner.config.probe_failure_threshold {
                        doomed.push((slot, DestroyReason::HealthCheckFailed));
                    } else {
                        survivors.push(slot);
                    }
                }
            }
        }

        {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            pending.settle(st, summary.probed);
            for slot in survivors.into_iter().rev() {
                if st.closing {
                    doomed.push((slot, DestroyReason::Shutdown));
                } else {
                    st.idle.push_front(slot);
                }
            }
            st.stats.destroyed += doomed.len() as u64;
            st.stats.last_probe = Some(summary);
        }
        inner.changed.notify_waiters();
        inner.close_now(doomed).await;
        summary
    }

    /// One health-monitor pass: evict, probe, stamp, publish.
    pub async fn health_cycle(&self) -> HealthCycle {
        let eviction = self.evict_idle().await;
        let probe = self.probe_idle().await;
        self.inner.state.lock().stats.last_health_check = Some(Utc::now());
        self.inner.events.emit(PoolEvent::HealthChecked {
            resource: self.inner.name.clone(),
            evicted: eviction.evicted,
            replaced: eviction.replaced,
            probed: probe.probed,
            failed: probe.failed,
        });
        trace!(
            resource = %self.inner.name,
            evicted = eviction.evicted,
            replaced = eviction.replaced,
            probed = probe.probed,
            failed = probe.failed,
            "health cycle complete"
        );
        HealthCycle { eviction, probe }
    }

    /// Move the pool's bounds.
    ///
    /// Growing takes effect immediately. Shrinking retires free checkout
    /// slots at once and the rest as leases come back; lent connections are
    /// never taken from their borrowers.
    pub fn resize(&self, new_min: usize, new_max: usize) -> Result<()> {
        let inner = &self.inner;
        let hard = inner.config.hard_ceiling();
        if new_max == 0 || new_min > new_max || new_max > hard {
            return Err(Error::configuration(format!(
                "cannot resize '{}' to min {new_min} / max {new_max} (hard ceiling {hard})",
                inner.name
            )));
        }

        let (old_max, doomed) = {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            if st.closing {
                return Err(Error::shutting_down(&inner.name));
            }
            let old_max = st.max_size;
            if new_max > old_max {
                let grow = new_max - old_max;
                let repaid = grow.min(st.shrink_debt);
                st.shrink_debt -= repaid;
                inner.permits.add_permits(grow - repaid);
            } else if new_max < old_max {
                let shrink = old_max - new_max;
                let retired = inner.permits.forget_permits(shrink);
                st.shrink_debt += shrink - retired;
            }
            st.min_size = new_min;
            st.max_size = new_max;

            let mut doomed = Vec::new();
            while st.occupied() > new_max {
                match st.idle.pop_front() {
                    Some(slot) => doomed.push((slot, DestroyReason::Shrink)),
                    None => break,
                }
            }
            st.stats.destroyed += doomed.len() as u64;
            (old_max, doomed)
        };

        inner.changed.notify_waiters();
        info!(resource = %inner.name, old_max, new_min, new_max, "pool resized");
        inner.events.emit(PoolEvent::Resized {
            resource: inner.name.clone(),
            min_size: new_min,
            max_size: new_max,
        });
        inner.close_later(doomed);
        Ok(())
    }

    /// Stop serving: refuse new acquires, close idle connections, wait up to
    /// `grace` for leases to come back, then force-close the rest.
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        let inner = &self.inner;
        let doomed: Vec<_> = {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            st.closing = true;
            let doomed: Vec<_> = st
                .idle
                .drain(..)
                .map(|slot| (slot, DestroyReason::Shutdown))
                .collect();
            st.stats.destroyed += doomed.len() as u64;
            doomed
        };
        inner.permits.close();
        inner.changed.notify_waiters();

        let closed_idle = doomed.len();
        info!(resource = %inner.name, closed_idle, ?grace, "draining pool");
        inner.close_now(doomed).await;

        let deadline = Instant::now() + grace;
        loop {
            let notified = inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = inner.state.lock();
                if st.active + st.pending == 0 {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let force_closed = inner.state.lock().active;
        if force_closed > 0 {
            inner.force_closed.store(true, Ordering::Release);
            warn!(resource = %inner.name, force_closed, "grace period over, force-closing leased connections");
        }
        DrainOutcome {
            closed_idle,
            force_closed,
        }
    }

    pub(crate) fn note_monitor_restart(&self) -> u64 {
        let mut st = self.inner.state.lock();
        st.stats.monitor_restarts += 1;
        st.stats.monitor_restarts
    }
}

// ---------------------------------------------------------------------------
// Checkout and return paths
// ---------------------------------------------------------------------------

impl<C: Connector> PoolInner<C> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_force_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire)
    }

    async fn checkout(
        self: &Arc<Self>,
        started: Instant,
        timeout: Duration,
        trial: &mut TrialGuard<'_>,
    ) -> Result<PooledConnection<C>> {
        let deadline = started + timeout;

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::shutting_down(&self.name)),
            Err(TryAcquireError::NoPermits) => {
                let waiters = {
                    let mut st = self.state.lock();
                    st.waiters += 1;
                    st.stats.exhaustions += 1;
                    st.waiters
                };
                let _queued = WaiterGuard { inner: self };
                self.events.emit(PoolEvent::Exhausted {
                    resource: self.name.clone(),
                    waiters,
                });
                trace!(resource = %self.name, waiters, "all slots busy, queueing");
                match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(Error::shutting_down(&self.name)),
                    Err(_) => return Err(self.timed_out(started, timeout, trial)),
                }
            }
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut st = self.state.lock();
                if st.closing {
                    return Err(Error::shutting_down(&self.name));
                }
                if let Some(slot) = st.idle.pop_back() {
                    st.pending += 1;
                    Next::Idle(slot)
                } else if st.occupied() < st.max_size {
                    st.pending += 1;
                    Next::Create
                } else {
                    Next::Wait
                }
            };

            match next {
                Next::Idle(mut slot) => {
                    let pending = PendingGuard {
                        inner: self,
                        count: 1,
                    };
                    if let Some(reason) = self.expiry(&slot.info, Instant::now()) {
                        self.discard(pending, slot, reason);
                        continue;
                    }
                    if self.connector.is_alive(&mut slot.conn).await {
                        return Ok(self.lend(slot, permit, started, true, pending, trial));
                    }
                    self.discard(pending, slot, DestroyReason::LivenessFailed);
                }
                Next::Create => {
                    let pending = PendingGuard {
                        inner: self,
                        count: 1,
                    };
                    match tokio::time::timeout_at(deadline, self.open_connection()).await {
                        Ok(Ok(slot)) => {
                            return Ok(self.lend(slot, permit, started, false, pending, trial));
                        }
                        Ok(Err(failure)) => {
                            drop(pending);
                            return Err(self.construction_failed(failure, started, trial));
                        }
                        Err(_) => {
                            drop(pending);
                            return Err(self.timed_out(started, timeout, trial));
                        }
                    }
                }
                Next::Wait => {
                    // Holding a slot while the ceiling is taken up by
                    // connections in flight (shrink or probe); wait for change.
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.timed_out(started, timeout, trial));
                    }
                }
            }
        }
    }

    fn lend(
        self: &Arc<Self>,
        mut slot: Slot<C::Connection>,
        permit: OwnedSemaphorePermit,
        started: Instant,
        reused: bool,
        mut pending: PendingGuard<'_, C>,
        trial: &mut TrialGuard<'_>,
    ) -> PooledConnection<C> {
        let now = Instant::now();
        let wait = now.duration_since(started);
        slot.info.use_count += 1;
        slot.info.last_used = now;
        slot.info.health = ConnectionHealth::Healthy;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            pending.settle(st, 1);
            st.active += 1;
            let active = st.active;
            st.stats.record_acquired(wait, reused, active);
        }
        trial.success();

        trace!(
            resource = %self.name,
            connection = %slot.info.id,
            wait_ms = wait.as_millis() as u64,
            reused,
            "connection acquired"
        );
        self.events.emit(PoolEvent::Acquired {
            resource: self.name.clone(),
            connection: slot.info.id,
            wait,
            reused,
        });
        PooledConnection::new(slot, permit, Arc::clone(self), now)
    }

    fn discard(
        self: &Arc<Self>,
        pending: PendingGuard<'_, C>,
        slot: Slot<C::Connection>,
        reason: DestroyReason,
    ) {
        self.state.lock().stats.destroyed += 1;
        drop(pending);
        self.close_later(vec![(slot, reason)]);
    }

    fn timed_out(&self, started: Instant, timeout: Duration, trial: &mut TrialGuard<'_>) -> Error {
        let err = {
            let mut st = self.state.lock();
            st.stats.record_failed(started.elapsed(), true);
            Error::AcquisitionTimeout {
                resource: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
                pool_size: st.size(),
                max_size: st.max_size,
                circuit_state: self.breaker.state(),
            }
        };
        if self.breaker.config().count_timeouts {
            trial.failure();
        }
        debug!(resource = %self.name, timeout_ms = timeout.as_millis() as u64, "acquire timed out");
        self.emit_failed(&err);
        err
    }

    fn construction_failed(
        &self,
        failure: RetryError<BoxError>,
        started: Instant,
        trial: &mut TrialGuard<'_>,
    ) -> Error {
        let (pool_size, max_size) = {
            let mut st = self.state.lock();
            st.stats.record_failed(started.elapsed(), false);
            (st.size(), st.max_size)
        };
        trial.failure();
        let err = Error::ConnectionConstruction {
            resource: self.name.clone(),
            attempts: failure.attempts,
            pool_size,
            max_size,
            circuit_state: self.breaker.state(),
            source: failure.last,
        };
        warn!(resource = %self.name, error = %err, "could not open connection");
        self.emit_failed(&err);
        err
    }

    /// Open one connection, retrying with backoff; each attempt is bounded by
    /// `connect_timeout`.
    async fn open_connection(&self) -> std::result::Result<Slot<C::Connection>, RetryError<BoxError>> {
        let connector = &self.connector;
        let connect_timeout = self.config.connect_timeout;
        let conn = retry(&self.config.connect_retry, |attempt| async move {
            trace!(resource = %self.name, attempt, "opening connection");
            match tokio::time::timeout(connect_timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(BoxError::from(format!(
                    "connect timed out after {}ms",
                    connect_timeout.as_millis()
                ))),
            }
        })
        .await?;

        let slot = Slot::new(conn, Instant::now());
        self.state.lock().stats.created += 1;
        debug!(resource = %self.name, kind = self.connector.kind(), connection = %slot.info.id, "connection opened");
        self.events.emit(PoolEvent::Created {
            resource: self.name.clone(),
            connection: slot.info.id,
        });
        Ok(slot)
    }

    /// Return path shared by explicit release and lease drop.
    pub(crate) fn release_slot(
        self: &Arc<Self>,
        mut slot: Slot<C::Connection>,
        permit: Option<OwnedSemaphorePermit>,
        healthy: Option<bool>,
        held: Duration,
    ) -> Result<()> {
        let id = slot.info.id;
        if self.is_force_closed() {
            drop(permit);
            {
                let mut st = self.state.lock();
                st.active = st.active.saturating_sub(1);
                st.stats.destroyed += 1;
            }
            self.changed.notify_waiters();
            self.close_later(vec![(slot, DestroyReason::Shutdown)]);
            return Err(Error::shutting_down(&self.name));
        }

        let now = Instant::now();
        let (doomed, closing) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.active = st.active.saturating_sub(1);

            let reason = if healthy == Some(false) {
                Some(DestroyReason::ReleasedUnhealthy)
            } else if st.closing {
                Some(DestroyReason::Shutdown)
            } else if let Some(reason) = self.expiry(&slot.info, now) {
                Some(reason)
            } else if st.occupied() >= st.max_size {
                Some(DestroyReason::Shrink)
            } else {
                None
            };

            match permit {
                Some(permit) if st.shrink_debt > 0 => {
                    st.shrink_debt -= 1;
                    permit.forget();
                }
                other => drop(other),
            }

            let doomed = match reason {
                Some(reason) => {
                    st.stats.destroyed += 1;
                    Some((slot, reason))
                }
                None => {
                    slot.info.last_used = now;
                    slot.info.health = if healthy.is_some() {
                        ConnectionHealth::Healthy
                    } else {
                        ConnectionHealth::Unknown
                    };
                    st.idle.push_back(slot);
                    None
                }
            };
            (doomed, st.closing)
        };
        self.changed.notify_waiters();

        match healthy {
            Some(true) => self.breaker.record_success(),
            Some(false) => self.breaker.record_failure(),
            None => {}
        }
        trace!(resource = %self.name, connection = %id, ?healthy, held_ms = held.as_millis() as u64, "connection released");
        self.events.emit(PoolEvent::Released {
            resource: self.name.clone(),
            connection: id,
            held,
            healthy,
        });
        if let Some(doomed) = doomed {
            self.close_later(vec![doomed]);
        }

        if closing {
            Err(Error::shutting_down(&self.name))
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Refill
    // -----------------------------------------------------------------------

    /// Reserve room for the connections missing to reach `min_size`.
    fn reserve_deficit(&self) -> usize {
        let mut st = self.state.lock();
        if st.closing {
            return 0;
        }
        let occupied = st.occupied();
        let deficit = st
            .min_size
            .saturating_sub(occupied)
            .min(st.max_size.saturating_sub(occupied));
        st.pending += deficit;
        deficit
    }

    /// Open `reserved` connections into the idle set. Stops at the first
    /// failure or while the circuit is open.
    async fn replenish(&self, reserved: usize) -> usize {
        let mut pending = PendingGuard {
            inner: self,
            count: reserved,
        };
        let mut opened = 0;
        while pending.count > 0 {
            if self.breaker.state() == State::Open {
                debug!(resource = %self.name, "circuit open, skipping refill");
                break;
            }
            match self.open_connection().await {
                Ok(slot) => {
                    self.breaker.record_success();
                    let leftover = {
                        let mut guard = self.state.lock();
                        let st = &mut *guard;
                        pending.settle(st, 1);
                        if st.closing {
                            st.stats.destroyed += 1;
                            Some(slot)
                        } else {
                            st.idle.push_back(slot);
                            opened += 1;
                            None
                        }
                    };
                    self.changed.notify_waiters();
                    if let Some(slot) = leftover {
                        self.connector.close(slot.conn).await;
                    }
                }
                Err(failure) => {
                    self.breaker.record_failure();
                    warn!(
                        resource = %self.name,
                        attempts = failure.attempts,
                        error = %failure.last,
                        "could not refill pool to min_size"
                    );
                    break;
                }
            }
        }
        opened
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn expiry(&self, info: &ConnectionInfo, now: Instant) -> Option<DestroyReason> {
        if now.duration_since(info.created_at) > self.config.max_lifetime {
            Some(DestroyReason::Expired)
        } else if now.duration_since(info.last_used) > self.config.idle_timeout {
            Some(DestroyReason::IdleTimeout)
        } else {
            None
        }
    }

    fn emit_failed(&self, err: &Error) {
        self.events.emit(PoolEvent::AcquireFailed {
            resource: self.name.clone(),
            error: err.to_string(),
        });
    }

    fn announce(&self, doomed: &[(Slot<C::Connection>, DestroyReason)]) {
        for (slot, reason) in doomed {
            debug!(resource = %self.name, connection = %slot.info.id, %reason, "closing connection");
            self.events.emit(PoolEvent::Destroyed {
                resource: self.name.clone(),
                connection: slot.info.id,
                reason: *reason,
            });
        }
    }

    async fn close_now(&self, doomed: Vec<(Slot<C::Connection>, DestroyReason)>) {
        self.announce(&doomed);
        for (slot, _) in doomed {
            self.connector.close(slot.conn).await;
        }
    }

    /// Close from a synchronous context: on a spawned task when a runtime is
    /// around, by dropping the handles otherwise.
    fn close_later(&self, doomed: Vec<(Slot<C::Connection>, DestroyReason)>) {
        if doomed.is_empty() {
            return;
        }
        self.announce(&doomed);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connector = Arc::clone(&self.connector);
            drop(handle.spawn(async move {
                for (slot, _) in doomed {
                    connector.close(slot.conn).await;
                }
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Resolves the half-open trial if the acquire ends without a verdict
/// (timeout, shutdown, or the caller dropping the future).
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    /// Set while this acquire owns the half-open trial.
    generation: Option<u64>,
}

impl TrialGuard<'_> {
    /// Closes the circuit for a trial checkout. Ordinary checkouts report
    /// their outcome on release instead.
    fn success(&mut self) {
        if self.generation.take().is_some() {
            self.breaker.record_success();
        }
    }

    fn failure(&mut self) {
        self.generation = None;
        self.breaker.record_failure();
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            self.breaker.abandon_trial(generation);
        }
    }
}

/// Releases `pending` reservations that were not settled, including when a
/// future is dropped mid-await or a probe panics.
struct PendingGuard<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    count: usize,
}

impl<C: Connector> PendingGuard<'_, C> {
    /// Settle `n` reservations under a lock the caller already holds.
    fn settle(&mut self, st: &mut PoolState<C::Connection>, n: usize) {
        let n = n.min(self.count);
        st.pending -= n;
        self.count -= n;
    }
}

impl<C: Connector> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if self.count > 0 {
            let mut st = self.inner.state.lock();
            st.pending = st.pending.saturating_sub(self.count);
            drop(st);
            self.count = 0;
            self.inner.changed.notify_waiters();
        }
    }
}

struct WaiterGuard<'a, C: Connector> {
    inner: &'a PoolInner<C>,
}

impl<C: Connector> Drop for WaiterGuard<'_, C> {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock();
        st.waiters = st.waiters.saturating_sub(1);
    }
}
