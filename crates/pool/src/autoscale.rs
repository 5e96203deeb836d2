//! Auto-scaling policy and the per-pool scaler.
//!
//! Every `evaluation_interval` the scaler folds a pool's [`PoolMetrics`] into
//! a load score and moves the pool's `max_size` by a fixed step once the score
//! has stayed past a threshold long enough. Growth reacts faster than shrink.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::PoolEvent;
use crate::manager::ManagedPool;
use crate::metrics::PoolMetrics;

/// Error rate at which the error component of the load score saturates.
const ERROR_RATE_SATURATION: f64 = 0.2;

// ---------------------------------------------------------------------------
// AutoScalePolicy
// ---------------------------------------------------------------------------

/// Relative weight of each load-score component. Normalised on use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    pub utilization: f64,
    pub latency: f64,
    pub errors: f64,
    pub queue: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            utilization: 0.3,
            latency: 0.3,
            errors: 0.2,
            queue: 0.2,
        }
    }
}

impl LoadWeights {
    fn total(&self) -> f64 {
        self.utilization + self.latency + self.errors + self.queue
    }
}

/// When and how far the scaler moves a pool's ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalePolicy {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Load score above which to grow, `(0.0, 1.0]`.
    pub scale_up_threshold: f64,
    /// Load score below which to shrink, `[0.0, scale_up_threshold)`.
    pub scale_down_threshold: f64,
    /// How long the score must stay high before the first step up.
    #[serde(with = "humantime_serde")]
    pub scale_up_sustain: Duration,
    /// How long the score must stay low before the first step down.
    #[serde(with = "humantime_serde")]
    pub scale_down_sustain: Duration,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    /// p95 acquire wait that counts as full latency pressure.
    #[serde(with = "humantime_serde")]
    pub target_wait: Duration,
    /// Queued callers that count as full queue pressure.
    pub queue_saturation: usize,
    pub weights: LoadWeights,
}

impl Default for AutoScalePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval: Duration::from_secs(15),
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.3,
            scale_up_sustain: Duration::from_secs(30),
            scale_down_sustain: Duration::from_secs(120),
            scale_up_step: 2,
            scale_down_step: 1,
            target_wait: Duration::from_millis(100),
            queue_saturation: 50,
            weights: LoadWeights::default(),
        }
    }
}

impl AutoScalePolicy {
    /// Validate the policy, returning an error if any field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.scale_up_threshold <= 0.0 || self.scale_up_threshold > 1.0 {
            return Err(Error::configuration(
                "scale_up_threshold must be in (0.0, 1.0]",
            ));
        }
        if self.scale_down_threshold < 0.0 || self.scale_down_threshold >= self.scale_up_threshold
        {
            return Err(Error::configuration(
                "scale_down_threshold must be in [0.0, scale_up_threshold)",
            ));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(Error::configuration("scaling steps must be > 0"));
        }
        if self.evaluation_interval.is_zero() {
            return Err(Error::configuration(
                "evaluation_interval must be greater than zero",
            ));
        }
        if self.target_wait.is_zero() {
            return Err(Error::configuration("target_wait must be greater than zero"));
        }
        if self.queue_saturation == 0 {
            return Err(Error::configuration("queue_saturation must be at least 1"));
        }
        let w = &self.weights;
        if [w.utilization, w.latency, w.errors, w.queue]
            .iter()
            .any(|v| *v < 0.0 || !v.is_finite())
            || w.total() <= 0.0
        {
            return Err(Error::configuration(
                "load weights must be non-negative and not all zero",
            ));
        }
        Ok(())
    }

    /// Weighted load in `0.0..=1.0`.
    ///
    /// Components: utilization (`active / max_size`), p95 wait against
    /// `target_wait`, recent error rate (saturating at 20%), and queued
    /// callers against `queue_saturation`.
    pub fn load_score(&self, metrics: &PoolMetrics) -> f64 {
        let w = &self.weights;
        let target_ms = self.target_wait.as_secs_f64() * 1000.0;
        let utilization = metrics.utilization();
        let latency = (metrics.p95_wait_ms / target_ms).min(1.0);
        let errors = (metrics.error_rate / ERROR_RATE_SATURATION).min(1.0);
        let queue = (metrics.waiters as f64 / self.queue_saturation as f64).min(1.0);

        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        ((w.utilization * utilization + w.latency * latency + w.errors * errors + w.queue * queue)
            / total)
            .clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// ScalingDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
    None,
}

/// Outcome of one evaluation. Applied immediately, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub direction: ScaleDirection,
    /// Connections added to or removed from the ceiling.
    pub magnitude: usize,
    pub load_score: f64,
    pub current_max: usize,
    pub target_max: usize,
}

impl ScalingDecision {
    fn hold(load_score: f64, current_max: usize) -> Self {
        Self {
            direction: ScaleDirection::None,
            magnitude: 0,
            load_score,
            current_max,
            target_max: current_max,
        }
    }

    pub fn is_change(&self) -> bool {
        self.direction != ScaleDirection::None
    }
}

// ---------------------------------------------------------------------------
// AutoScaler
// ---------------------------------------------------------------------------

/// Hysteresis state for one pool.
///
/// Once the score has stayed past a threshold for the sustain period, every
/// further evaluation on the same side moves the ceiling by one step until
/// it reaches the hard ceiling (growing) or `max(min_size, 1)` (shrinking).
#[derive(Debug)]
pub struct AutoScaler {
    policy: AutoScalePolicy,
    high_since: Option<Instant>,
    low_since: Option<Instant>,
}

impl AutoScaler {
    #[must_use]
    pub fn new(policy: AutoScalePolicy) -> Self {
        Self {
            policy,
            high_since: None,
            low_since: None,
        }
    }

    pub fn policy(&self) -> &AutoScalePolicy {
        &self.policy
    }

    pub fn evaluate(&mut self, metrics: &PoolMetrics, now: Instant) -> ScalingDecision {
        let policy = &self.policy;
        let score = policy.load_score(metrics);
        let current = metrics.max_size;

        if score > policy.scale_up_threshold {
            self.low_since = None;
            let since = *self.high_since.get_or_insert(now);
            if now.duration_since(since) < policy.scale_up_sustain {
                return ScalingDecision::hold(score, current);
            }
            let target = (current + policy.scale_up_step).min(metrics.hard_max_size);
            if target <= current {
                return ScalingDecision::hold(score, current);
            }
            return ScalingDecision {
                direction: ScaleDirection::Up,
                magnitude: target - current,
                load_score: score,
                current_max: current,
                target_max: target,
            };
        }

        if score < policy.scale_down_threshold {
            self.high_since = None;
            let since = *self.low_since.get_or_insert(now);
            if now.duration_since(since) < policy.scale_down_sustain {
                return ScalingDecision::hold(score, current);
            }
            let floor = metrics.min_size.max(1);
            let target = current.saturating_sub(policy.scale_down_step).max(floor);
            if target >= current {
                return ScalingDecision::hold(score, current);
            }
            return ScalingDecision {
                direction: ScaleDirection::Down,
                magnitude: current - target,
                load_score: score,
                current_max: current,
                target_max: target,
            };
        }

        self.high_since = None;
        self.low_since = None;
        ScalingDecision::hold(score, current)
    }
}

/// Background loop: evaluate, resize, repeat until cancelled.
///
/// A failed resize is logged and the pool keeps its previous bounds.
pub(crate) async fn run(
    pool: Arc<dyn ManagedPool>,
    policy: AutoScalePolicy,
    cancel: CancellationToken,
) {
    let interval = policy.evaluation_interval;
    let mut scaler = AutoScaler::new(policy);
    debug!(resource = %pool.name(), ?interval, "auto-scaler started");

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = cancel.cancelled() => break,
        }

        let metrics = pool.metrics();
        let decision = scaler.evaluate(&metrics, Instant::now());
        if !decision.is_change() {
            trace!(resource = %pool.name(), load_score = decision.load_score, "no scaling");
            continue;
        }

        match pool.resize(metrics.min_size, decision.target_max) {
            Ok(()) => {
                info!(
                    resource = %pool.name(),
                    direction = ?decision.direction,
                    load_score = decision.load_score,
                    from = decision.current_max,
                    to = decision.target_max,
                    "pool scaled"
                );
                pool.events().emit(PoolEvent::Scaled {
                    resource: pool.name().to_string(),
                    decision,
                });
            }
            Err(e) => {
                warn!(resource = %pool.name(), error = %e, "resize failed, keeping current bounds");
            }
        }
    }
    debug!(resource = %pool.name(), "auto-scaler stopped");
}
