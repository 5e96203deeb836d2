//! Test helpers: a scriptable in-memory connector.
//!
//! Enabled for this crate's own tests and, for downstream crates, behind the
//! `testing` feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::connector::Connector;
use crate::error::BoxError;

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    probes: AtomicU64,
    fail_connects: AtomicBool,
    fail_probes: AtomicBool,
    dead: AtomicBool,
    panic_probes: AtomicU32,
    connect_delay_ms: AtomicU64,
}

/// Connection handed out by [`MockConnector`].
#[derive(Debug, PartialEq, Eq)]
pub struct MockConnection {
    /// Sequence number, starting at 0, in connect order.
    pub id: u64,
}

/// In-memory connector whose behaviour tests switch at runtime.
///
/// Clones share state, so a test can keep one clone to steer and inspect
/// while the pool owns another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections the pool closed so far.
    pub fn closes(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Health probes run so far.
    pub fn probes(&self) -> u64 {
        self.state.probes.load(Ordering::SeqCst)
    }

    /// Make every connect attempt fail (or succeed again).
    pub fn set_fail_connects(&self, fail: bool) {
        self.state.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Make every health probe fail (or succeed again).
    pub fn set_fail_probes(&self, fail: bool) {
        self.state.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Make the checkout liveness probe report every connection dead.
    pub fn set_dead(&self, dead: bool) {
        self.state.dead.store(dead, Ordering::SeqCst);
    }

    /// Panic inside the next `n` health probes.
    pub fn panic_next_probes(&self, n: u32) {
        self.state.panic_probes.store(n, Ordering::SeqCst);
    }

    /// Delay every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<MockConnection, BoxError> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_connects.load(Ordering::SeqCst) {
            return Err("mock connection refused".into());
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn is_alive(&self, _conn: &mut MockConnection) -> bool {
        !self.state.dead.load(Ordering::SeqCst)
    }

    async fn health_check(&self, _conn: &mut MockConnection) -> Result<(), BoxError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let panic_now = self
            .state
            .panic_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        assert!(!panic_now, "mock probe panicked");
        if self.state.fail_probes.load(Ordering::SeqCst) {
            return Err("mock probe failed".into());
        }
        Ok(())
    }

    async fn close(&self, _conn: MockConnection) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
