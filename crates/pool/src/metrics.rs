//! Pool statistics: the counters a pool keeps under its lock and the
//! read-only [`PoolMetrics`] snapshot handed to everyone else.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use resync_resilience::State;
use serde::Serialize;

/// Number of recent acquire outcomes kept for wait-time and error-rate figures.
pub const SAMPLE_WINDOW: usize = 1000;

/// Result of the last idle-probe pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub probed: usize,
    pub failed: usize,
}

impl ProbeSummary {
    /// Every probed connection failed.
    pub fn all_failed(&self) -> bool {
        self.probed > 0 && self.failed == self.probed
    }
}

/// Read-only copy of a pool's statistics.
///
/// Counters are cumulative since pool construction; they survive resizes and
/// reset only when a pool is recreated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub resource: String,
    pub active: usize,
    pub idle: usize,
    /// Callers queued for a checkout slot.
    pub waiters: usize,
    pub min_size: usize,
    /// Current (dynamic) ceiling.
    pub max_size: usize,
    /// Absolute ceiling auto-scaling never crosses.
    pub hard_max_size: usize,
    pub circuit_state: State,

    pub acquisition_attempts: u64,
    pub successful_acquisitions: u64,
    /// Timeouts and construction failures.
    pub acquisition_errors: u64,
    pub timeouts: u64,
    pub circuit_rejections: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
    /// Checkouts served from the idle set.
    pub pool_hits: u64,
    /// Checkouts that had to open a new connection.
    pub pool_misses: u64,
    /// Acquires that found every slot busy and had to queue.
    pub exhaustions: u64,
    pub peak_active: usize,

    pub avg_wait_ms: f64,
    pub p95_wait_ms: f64,
    pub max_wait_ms: f64,
    /// Failed share of the recent acquire outcomes, `0.0..=1.0`.
    pub error_rate: f64,

    pub last_health_check: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeSummary>,
    pub monitor_restarts: u64,
}

impl PoolMetrics {
    /// `active + idle`.
    pub fn size(&self) -> usize {
        self.active + self.idle
    }

    /// `active / max_size`, `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active as f64 / self.max_size as f64).min(1.0)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    wait: Duration,
    ok: bool,
}

/// Mutable counters, owned by the pool state and only touched under its lock.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub(crate) attempts: u64,
    pub(crate) successes: u64,
    pub(crate) errors: u64,
    pub(crate) timeouts: u64,
    pub(crate) circuit_rejections: u64,
    pub(crate) created: u64,
    pub(crate) destroyed: u64,
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) exhaustions: u64,
    pub(crate) peak_active: usize,
    pub(crate) last_health_check: Option<DateTime<Utc>>,
    pub(crate) last_probe: Option<ProbeSummary>,
    pub(crate) monitor_restarts: u64,
    samples: VecDeque<Sample>,
}

impl Stats {
    pub(crate) fn record_acquired(&mut self, wait: Duration, reused: bool, active: usize) {
        self.successes += 1;
        if reused {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.peak_active = self.peak_active.max(active);
        self.push(Sample { wait, ok: true });
    }

    /// Timeouts and construction failures: exactly one error per failed acquire.
    pub(crate) fn record_failed(&mut self, wait: Duration, timed_out: bool) {
        self.errors += 1;
        if timed_out {
            self.timeouts += 1;
        }
        self.push(Sample { wait, ok: false });
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() >= SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// `(avg, p95, max)` wait of successful acquires, in milliseconds.
    pub(crate) fn wait_summary(&self) -> (f64, f64, f64) {
        let mut waits: Vec<f64> = self
            .samples
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.wait.as_secs_f64() * 1000.0)
            .collect();
        if waits.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        waits.sort_by(f64::total_cmp);
        let avg = waits.iter().sum::<f64>() / waits.len() as f64;
        let rank = ((waits.len() as f64) * 0.95).ceil() as usize;
        let p95 = waits[rank.clamp(1, waits.len()) - 1];
        let max = waits[waits.len() - 1];
        (avg, p95, max)
    }

    pub(crate) fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failed = self.samples.iter().filter(|s| !s.ok).count();
        failed as f64 / self.samples.len() as f64
    }
}
