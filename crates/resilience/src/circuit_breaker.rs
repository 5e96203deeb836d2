//! Sliding-window circuit breaker.
//!
//! The state lives in an `AtomicU8` so the CLOSED and HALF_OPEN fast paths
//! never take the window lock. Every transition, together with the window
//! bookkeeping and the trial generation, happens under a `parking_lot::Mutex`
//! that is never held across an `.await`.
//!
//! Transitions only ever follow:
//!
//! ```text
//! CLOSED ──threshold──▶ OPEN ──recovery elapsed──▶ HALF_OPEN ──trial ok──▶ CLOSED
//!                        ▲                             │
//!                        └────────trial failed─────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{ConfigError, ConfigResult};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Requests flow normally
    Closed,
    /// Requests are rejected immediately
    Open,
    /// A single trial request is in flight
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl State {
    const fn to_atomic(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Breaker thresholds. Durations (de)serialise as `"30s"`, `"1m"`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that open the circuit.
    pub failure_threshold: usize,
    /// Failure ratio inside `window` that opens the circuit once at least
    /// `min_calls` outcomes were recorded.
    pub failure_rate_threshold: f64,
    pub min_calls: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long the circuit stays OPEN before a trial is let through.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Whether acquisition timeouts count as failures.
    pub count_timeouts: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_calls: 10,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            count_timeouts: false,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64, min_calls: usize) -> Self {
        self.failure_rate_threshold = rate;
        self.min_calls = min_calls;
        self
    }

    #[must_use]
    pub fn with_count_timeouts(mut self, count: bool) -> Self {
        self.count_timeouts = count;
        self
    }

    /// Validate configuration at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::validation(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::validation(
                "failure_rate_threshold",
                format!("{} is outside (0.0, 1.0]", self.failure_rate_threshold),
            ));
        }
        if self.min_calls == 0 {
            return Err(ConfigError::validation("min_calls", "must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::validation("window", "must be positive"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::validation(
                "recovery_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Outcome of asking the breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit is CLOSED.
    Allowed,
    /// This caller flipped OPEN → HALF_OPEN and owns the single trial. It must
    /// resolve it with `record_success`, `record_failure` or `abandon_trial`.
    Trial {
        /// Identifies this trial to [`CircuitBreaker::abandon_trial`].
        generation: u64,
    },
    Rejected {
        state: State,
        /// Time left until a trial is let through, when OPEN.
        retry_after: Option<Duration>,
    },
}

impl Admission {
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// A state change, reported to the [`TransitionListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub breaker: String,
    pub from: State,
    pub to: State,
}

/// Called after every transition, outside the breaker's lock.
pub type TransitionListener = Arc<dyn Fn(&Transition) + Send + Sync>;

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: State,
    pub failures_in_window: usize,
    pub calls_in_window: usize,
    pub failure_rate: f64,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub times_opened: u64,
    #[serde(with = "humantime_serde")]
    pub time_in_state: Duration,
}

/// Sliding window of recent outcomes.
///
/// No internal lock; callers hold the breaker's inner mutex.
#[derive(Debug)]
struct SlidingWindow {
    entries: VecDeque<WindowEntry>,
    window: Duration,
    max_entries: usize,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp: Instant,
    was_failure: bool,
}

impl SlidingWindow {
    fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            window,
            max_entries,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.timestamp) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, was_failure: bool) {
        self.prune(now);
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(WindowEntry {
            timestamp: now,
            was_failure,
        });
    }

    /// `(calls, failures)` inside the window.
    fn counts(&mut self, now: Instant) -> (usize, usize) {
        self.prune(now);
        let failures = self.entries.iter().filter(|e| e.was_failure).count();
        (self.entries.len(), failures)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct Inner {
    window: SlidingWindow,
    opened_at: Option<Instant>,
    /// Bumped each time a trial is admitted.
    trial_generation: u64,
    last_transition: Instant,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    times_opened: u64,
}

/// Per-resource circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<Inner>,
    listener: Option<TransitionListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        let max_entries = config.min_calls.max(config.failure_threshold).max(1000);
        Ok(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                window: SlidingWindow::new(config.window, max_entries),
                opened_at: None,
                trial_generation: 0,
                last_transition: Instant::now(),
                consecutive_failures: 0,
                total_successes: 0,
                total_failures: 0,
                rejected: 0,
                times_opened: 0,
            }),
            config,
            state: AtomicU8::new(State::Closed.to_atomic()),
            listener: None,
        })
    }

    /// Attach a listener that observes every transition.
    #[must_use]
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state; lock-free.
    pub fn state(&self) -> State {
        State::from_atomic(self.state.load(Ordering::Acquire))
    }

    /// `true` when the caller may proceed.
    ///
    /// When OPEN and `recovery_timeout` has elapsed, exactly one caller gets
    /// `true` and moves the breaker to HALF_OPEN; everyone else is rejected
    /// until that trial resolves.
    pub fn allow_request(&self) -> bool {
        self.try_acquire().is_allowed()
    }

    /// Like [`allow_request`](Self::allow_request), but tells the caller
    /// whether it owns the half-open trial.
    pub fn try_acquire(&self) -> Admission {
        match self.state() {
            State::Closed => Admission::Allowed,
            State::HalfOpen => self.reject(State::HalfOpen, None),
            State::Open => {
                let now = Instant::now();
                let generation = {
                    let mut inner = self.inner.lock();
                    // Re-read under the lock every transition holds.
                    match self.state() {
                        State::Closed => return Admission::Allowed,
                        State::HalfOpen => {
                            inner.rejected += 1;
                            return Admission::Rejected {
                                state: State::HalfOpen,
                                retry_after: None,
                            };
                        }
                        State::Open => {}
                    }
                    let remaining = inner.opened_at.map_or(Duration::ZERO, |opened| {
                        self.config
                            .recovery_timeout
                            .saturating_sub(now.duration_since(opened))
                    });
                    if !remaining.is_zero() {
                        inner.rejected += 1;
                        return Admission::Rejected {
                            state: State::Open,
                            retry_after: Some(remaining),
                        };
                    }
                    inner.trial_generation += 1;
                    self.set_state(&mut inner, State::HalfOpen, now);
                    inner.trial_generation
                };
                info!(breaker = %self.name, generation, "circuit half-open, admitting trial request");
                self.notify(State::Open, State::HalfOpen);
                Admission::Trial { generation }
            }
        }
    }

    fn reject(&self, state: State, retry_after: Option<Duration>) -> Admission {
        self.inner.lock().rejected += 1;
        Admission::Rejected { state, retry_after }
    }

    /// Record a successful operation against the resource.
    pub fn record_success(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.window.record(now, false);
            inner.total_successes += 1;
            inner.consecutive_failures = 0;
            match self.state() {
                State::HalfOpen => {
                    inner.window.clear();
                    inner.opened_at = None;
                    self.set_state(&mut inner, State::Closed, now);
                    Some((State::HalfOpen, State::Closed))
                }
                State::Closed => None,
                State::Open => {
                    debug!(breaker = %self.name, "late success while open, ignored");
                    None
                }
            }
        };
        if let Some((from, to)) = transition {
            info!(breaker = %self.name, "trial succeeded, circuit closed");
            self.notify(from, to);
        }
    }

    /// Record a failed operation against the resource.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.window.record(now, true);
            inner.total_failures += 1;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            match self.state() {
                State::Closed => {
                    let (calls, failures) = inner.window.counts(now);
                    let rate = failures as f64 / calls as f64;
                    let over_count = failures >= self.config.failure_threshold;
                    let over_rate = calls >= self.config.min_calls
                        && rate >= self.config.failure_rate_threshold;
                    if over_count || over_rate {
                        warn!(
                            breaker = %self.name,
                            failures,
                            calls,
                            failure_rate = rate,
                            "failure threshold exceeded, circuit opened"
                        );
                        self.open(&mut inner, now);
                        Some((State::Closed, State::Open))
                    } else {
                        None
                    }
                }
                State::HalfOpen => {
                    warn!(breaker = %self.name, "trial failed, circuit re-opened");
                    self.open(&mut inner, now);
                    Some((State::HalfOpen, State::Open))
                }
                State::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    /// Give the half-open trial back without a verdict (the trial caller
    /// timed out or was cancelled).
    ///
    /// The breaker returns to OPEN with its original open timestamp, so the
    /// next caller is admitted as the new trial straight away. A no-op unless
    /// `generation` is the trial currently in flight.
    pub fn abandon_trial(&self, generation: u64) {
        let abandoned = {
            let mut inner = self.inner.lock();
            let current =
                self.state() == State::HalfOpen && inner.trial_generation == generation;
            if current {
                self.set_state(&mut inner, State::Open, Instant::now());
            }
            current
        };
        if abandoned {
            debug!(breaker = %self.name, generation, "trial abandoned, circuit back to open");
            self.notify(State::HalfOpen, State::Open);
        } else {
            trace!(breaker = %self.name, generation, "stale trial abandoned, ignored");
        }
    }

    /// Time left before an OPEN circuit admits a trial.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.state() != State::Open {
            return None;
        }
        let inner = self.inner.lock();
        inner.opened_at.map(|opened| {
            self.config
                .recovery_timeout
                .saturating_sub(opened.elapsed())
        })
    }

    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let (calls, failures) = inner.window.counts(now);
        CircuitStats {
            state: self.state(),
            failures_in_window: failures,
            calls_in_window: calls,
            failure_rate: if calls == 0 {
                0.0
            } else {
                failures as f64 / calls as f64
            },
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            times_opened: inner.times_opened,
            time_in_state: now.duration_since(inner.last_transition),
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.opened_at = Some(now);
        inner.times_opened += 1;
        self.set_state(inner, State::Open, now);
    }

    fn set_state(&self, inner: &mut Inner, state: State, now: Instant) {
        self.state.store(state.to_atomic(), Ordering::Release);
        inner.last_transition = now;
    }

    fn notify(&self, from: State, to: State) {
        if let Some(listener) = &self.listener {
            listener(&Transition {
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "orders-db",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[rstest]
    #[case::zero_threshold(CircuitBreakerConfig::default().with_failure_threshold(0), "failure_threshold")]
    #[case::rate_above_one(CircuitBreakerConfig::default().with_failure_rate(1.5, 10), "failure_rate_threshold")]
    #[case::zero_rate(CircuitBreakerConfig::default().with_failure_rate(0.0, 10), "failure_rate_threshold")]
    #[case::zero_min_calls(CircuitBreakerConfig::default().with_failure_rate(0.5, 0), "min_calls")]
    #[case::zero_window(CircuitBreakerConfig::default().with_window(Duration::ZERO), "window")]
    #[case::zero_recovery(CircuitBreakerConfig::default().with_recovery_timeout(Duration::ZERO), "recovery_timeout")]
    fn rejects_invalid_config(#[case] config: CircuitBreakerConfig, #[case] field: &str) {
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { field: f, .. } if f == field),
            "got {err:?}"
        );
    }

    #[test]
    fn config_parses_humantime_durations() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"window":"2m","recovery_timeout":"45s"}"#).unwrap();
        assert_eq!(config.window, Duration::from_secs(120));
        assert_eq!(config.recovery_timeout, Duration::from_secs(45));
        assert_eq!(config.failure_threshold, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let cb = breaker(5);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), State::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.record_failure();
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.stats().failures_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_on_failure_rate_once_min_calls_reached() {
        let cb = CircuitBreaker::new(
            "cache",
            CircuitBreakerConfig::default()
                .with_failure_threshold(100)
                .with_failure_rate(0.5, 4),
        )
        .unwrap();
        cb.record_success();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), State::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_until_recovery_then_admits_one_trial() {
        let cb = breaker(1);
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(29)).await;
        match cb.try_acquire() {
            Admission::Rejected {
                state: State::Open,
                retry_after: Some(left),
            } => assert_eq!(left, Duration::from_secs(1)),
            other => panic!("unexpected admission {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(cb.try_acquire(), Admission::Trial { .. }));
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_outcome_decides_next_state() {
        let cb = breaker(1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
        // Recovery clock restarted by the failed trial.
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.stats().calls_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_lets_next_caller_retry() {
        let cb = breaker(1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        let Admission::Trial { generation } = cb.try_acquire() else {
            panic!("expected a trial");
        };
        cb.abandon_trial(generation);
        assert_eq!(cb.state(), State::Open);
        assert!(matches!(cb.try_acquire(), Admission::Trial { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_abandon_does_not_end_the_current_trial() {
        let cb = breaker(1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        // First trial is still queued when another failure re-opens the circuit.
        let Admission::Trial { generation: first } = cb.try_acquire() else {
            panic!("expected a trial");
        };
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let Admission::Trial { generation: second } = cb.try_acquire() else {
            panic!("expected a second trial after recovery");
        };
        assert_ne!(first, second);

        // The first caller gives up late; the second trial stays the only one.
        cb.abandon_trial(first);
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(matches!(
            cb.try_acquire(),
            Admission::Rejected { state: State::HalfOpen, .. }
        ));

        cb.abandon_trial(second);
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_sees_every_transition_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = breaker(1).with_listener(Arc::new(move |t: &Transition| {
            sink.lock().push((t.from, t.to));
        }));

        cb.record_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_request());
        cb.record_success();

        assert_eq!(
            *seen.lock(),
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
    }

    #[test]
    fn state_display_and_serde_agree() {
        for state in [State::Closed, State::Open, State::HalfOpen] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }
}
