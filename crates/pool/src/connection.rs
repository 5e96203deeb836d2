//! Pooled connections and the lease handed to callers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use uuid::Uuid;

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::pool::PoolInner;

/// Unique identifier of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First group of the uuid is plenty for log correlation.
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// Last known health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Healthy,
    Unhealthy,
    /// Returned without a verdict (lease dropped without an explicit release);
    /// the checkout probe settles it.
    Unknown,
}

/// Lifecycle metadata of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Completed checkouts, including the current one while leased.
    pub use_count: u64,
    pub consecutive_errors: u32,
    pub health: ConnectionHealth,
}

impl ConnectionInfo {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            id: ConnectionId::new(),
            created_at: now,
            last_used: now,
            use_count: 0,
            consecutive_errors: 0,
            health: ConnectionHealth::Healthy,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// A connection handle plus its metadata, as stored in the idle set.
pub(crate) struct Slot<T> {
    pub(crate) conn: T,
    pub(crate) info: ConnectionInfo,
}

impl<T> Slot<T> {
    pub(crate) fn new(conn: T, now: Instant) -> Self {
        Self {
            conn,
            info: ConnectionInfo::new(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A checked-out connection.
///
/// Hand it back with [`release`](Self::release). Dropping the lease without
/// releasing returns the connection to the pool with an unknown health
/// verdict, so a slot is never leaked.
pub struct PooledConnection<C: Connector> {
    slot: Option<Slot<C::Connection>>,
    info: ConnectionInfo,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
    checked_out_at: Instant,
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("resource", &self.pool.name())
            .field("info", &self.info)
            .field("released", &self.slot.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConnection<C> {
    pub(crate) fn new(
        slot: Slot<C::Connection>,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner<C>>,
        now: Instant,
    ) -> Self {
        Self {
            info: slot.info.clone(),
            slot: Some(slot),
            permit: Some(permit),
            pool,
            checked_out_at: now,
        }
    }

    /// Name of the resource this lease belongs to.
    pub fn resource(&self) -> &str {
        self.pool.name()
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Metadata as of checkout.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner<C>> {
        &self.pool
    }

    pub fn is_released(&self) -> bool {
        self.slot.is_none()
    }

    /// How long this lease has been held.
    pub fn held_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }

    /// Borrow the underlying connection.
    pub fn get(&self) -> Result<&C::Connection> {
        self.check_usable()?;
        self.slot
            .as_ref()
            .map(|slot| &slot.conn)
            .ok_or_else(|| self.use_after_release())
    }

    /// Mutably borrow the underlying connection.
    pub fn get_mut(&mut self) -> Result<&mut C::Connection> {
        self.check_usable()?;
        let Self {
            slot, pool, info, ..
        } = self;
        match slot {
            Some(slot) => Ok(&mut slot.conn),
            None => Err(Error::UseAfterRelease {
                resource: pool.name().to_string(),
                connection: info.id,
            }),
        }
    }

    /// Hand the connection back.
    ///
    /// `healthy = false` destroys it instead of returning it to the idle set.
    /// Never suspends. A second call fails with [`Error::DoubleRelease`] and
    /// leaves the pool's counts untouched.
    pub fn release(&mut self, healthy: bool) -> Result<()> {
        let Some(slot) = self.slot.take() else {
            return Err(Error::DoubleRelease {
                resource: self.pool.name().to_string(),
                connection: self.info.id,
            });
        };
        let permit = self.permit.take();
        let held = self.checked_out_at.elapsed();
        self.pool.release_slot(slot, permit, Some(healthy), held)
    }

    fn check_usable(&self) -> Result<()> {
        if self.pool.is_force_closed() {
            return Err(Error::shutting_down(self.pool.name()));
        }
        Ok(())
    }

    fn use_after_release(&self) -> Error {
        Error::UseAfterRelease {
            resource: self.pool.name().to_string(),
            connection: self.info.id,
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let held = self.checked_out_at.elapsed();
            let _ = self
                .pool
                .release_slot(slot, self.permit.take(), None, held);
        }
    }
}
