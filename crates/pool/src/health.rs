//! Health assessment: alert thresholds, per-resource health, and the report
//! the manager hands to an operational endpoint.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use resync_resilience::State;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manager::ManagerState;
use crate::metrics::PoolMetrics;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Warning and critical levels for the figures a pool is judged on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// `active / max_size`
    pub utilization_warning: f64,
    pub utilization_critical: f64,
    pub wait_warning_ms: f64,
    pub wait_critical_ms: f64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            utilization_warning: 0.8,
            utilization_critical: 0.9,
            wait_warning_ms: 100.0,
            wait_critical_ms: 500.0,
            error_rate_warning: 0.05,
            error_rate_critical: 0.10,
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<()> {
        for (name, warning, critical) in [
            ("utilization", self.utilization_warning, self.utilization_critical),
            ("wait", self.wait_warning_ms, self.wait_critical_ms),
            ("error_rate", self.error_rate_warning, self.error_rate_critical),
        ] {
            if !(warning >= 0.0 && warning <= critical) {
                return Err(Error::configuration(format!(
                    "{name} alert thresholds must satisfy 0 <= warning <= critical"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Utilization,
    WaitTime,
    ErrorRate,
    /// Callers are queued for a slot.
    Exhaustion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

impl Alert {
    fn check(
        kind: AlertKind,
        label: &str,
        value: f64,
        warning: f64,
        critical: f64,
    ) -> Option<Self> {
        let (severity, threshold) = if value >= critical {
            (Severity::Critical, critical)
        } else if value >= warning {
            (Severity::Warning, warning)
        } else {
            return None;
        };
        Some(Self {
            kind,
            severity,
            value,
            threshold,
            message: format!("{label} {value:.2} at or above {threshold:.2}"),
        })
    }
}

/// Alerts raised by one metrics snapshot, most severe first.
pub fn alerts_for(metrics: &PoolMetrics, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = [
        Alert::check(
            AlertKind::Utilization,
            "utilization",
            metrics.utilization(),
            thresholds.utilization_warning,
            thresholds.utilization_critical,
        ),
        Alert::check(
            AlertKind::WaitTime,
            "average wait (ms)",
            metrics.avg_wait_ms,
            thresholds.wait_warning_ms,
            thresholds.wait_critical_ms,
        ),
        Alert::check(
            AlertKind::ErrorRate,
            "error rate",
            metrics.error_rate,
            thresholds.error_rate_warning,
            thresholds.error_rate_critical,
        ),
    ]
    .into_iter()
    .flatten()
    .collect();

    if metrics.waiters > 0 {
        alerts.push(Alert {
            kind: AlertKind::Exhaustion,
            severity: if metrics.waiters >= metrics.max_size {
                Severity::Critical
            } else {
                Severity::Warning
            },
            value: metrics.waiters as f64,
            threshold: 1.0,
            message: format!("{} caller(s) waiting for a connection", metrics.waiters),
        });
    }

    alerts.sort_by(|a, b| b.severity.cmp(&a.severity));
    alerts
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// One resource's entry in the health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHealth {
    pub status: HealthStatus,
    pub active: usize,
    pub idle: usize,
    pub max_size: usize,
    pub circuit_state: State,
    pub avg_wait_ms: f64,
    pub error_rate: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub alerts: Vec<Alert>,
}

impl ResourceHealth {
    /// Judge one pool.
    ///
    /// Unhealthy while the circuit is open or when the last probe pass found
    /// no live connection; degraded on any alert or a half-open circuit.
    pub fn assess(metrics: &PoolMetrics, thresholds: &AlertThresholds) -> Self {
        let alerts = alerts_for(metrics, thresholds);
        let probe_dead = metrics.last_probe.is_some_and(|p| p.all_failed());
        let status = if metrics.circuit_state == State::Open || probe_dead {
            HealthStatus::Unhealthy
        } else if metrics.circuit_state == State::HalfOpen || !alerts.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            active: metrics.active,
            idle: metrics.idle,
            max_size: metrics.max_size,
            circuit_state: metrics.circuit_state,
            avg_wait_ms: metrics.avg_wait_ms,
            error_rate: metrics.error_rate,
            last_health_check: metrics.last_health_check,
            alerts,
        }
    }
}

/// `{resource: health}` plus the manager's own state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: ManagerState,
    /// Worst status across resources; healthy when there are none.
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub resources: BTreeMap<String, ResourceHealth>,
}

impl HealthReport {
    pub fn new(state: ManagerState, resources: BTreeMap<String, ResourceHealth>) -> Self {
        let status = resources
            .values()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            state,
            status,
            generated_at: Utc::now(),
            resources,
        }
    }
}
