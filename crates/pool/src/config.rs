//! Pool and manager configuration.
//!
//! Everything here deserialises from plain structured values; durations are
//! human-readable strings such as `"30s"` or `"5m"`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use resync_resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::autoscale::AutoScalePolicy;
use crate::error::{Error, Result};
use crate::health::AlertThresholds;

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Per-resource pool configuration.
///
/// Fixed for the lifetime of a pool; applying a different configuration
/// builds a new pool (see `PoolManager::reconfigure`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open even when nobody asks for them.
    pub min_size: usize,
    /// Initial ceiling on `active + idle`; auto-scaling moves it.
    pub max_size: usize,
    /// Absolute ceiling; defaults to `max_size`.
    pub hard_max_size: Option<usize>,
    /// Bound on a single connect attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Idle connections probed per health cycle.
    pub probe_sample: usize,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive failed health probes before an idle connection is closed.
    pub probe_failure_threshold: u32,
    pub connect_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            hard_max_size: None,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            health_check_interval: Duration::from_secs(60),
            probe_sample: 3,
            probe_timeout: Duration::from_secs(5),
            probe_failure_threshold: 3,
            connect_retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Ceiling auto-scaling may grow `max_size` to.
    pub fn hard_ceiling(&self) -> usize {
        self.hard_max_size.unwrap_or(self.max_size)
    }

    #[must_use]
    pub fn with_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_hard_max(mut self, hard_max_size: usize) -> Self {
        self.hard_max_size = Some(hard_max_size);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    #[must_use]
    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_size > self.hard_ceiling() {
            return Err(Error::configuration(format!(
                "max_size ({}) must not exceed hard_max_size ({})",
                self.max_size,
                self.hard_ceiling()
            )));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
            ("max_lifetime", self.max_lifetime),
            ("health_check_interval", self.health_check_interval),
            ("probe_timeout", self.probe_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.probe_failure_threshold == 0 {
            return Err(Error::configuration(
                "probe_failure_threshold must be at least 1",
            ));
        }
        self.connect_retry.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resource specs
// ---------------------------------------------------------------------------

/// Which connector serves a configured resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Plain TCP (`host:port`).
    Tcp,
    /// HTTP endpoint (base URL), requires the `http` feature.
    Http,
    /// Redis URL, requires the `redis` feature.
    Redis,
    /// Postgres URL, requires the `postgres` feature.
    Postgres,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Redis => "redis",
            Self::Postgres => "postgres",
        })
    }
}

/// One configured resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Address, URL or DSN, depending on `kind`.
    pub target: String,
    /// Path probed by the HTTP connector.
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
}

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Manager-wide policies plus the resources an application declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long `shutdown` waits for leases before force-closing them.
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
    /// Template for every resource's breaker.
    pub breaker: CircuitBreakerConfig,
    pub autoscale: AutoScalePolicy,
    pub alerts: AlertThresholds,
    pub event_capacity: usize,
    pub resources: BTreeMap<String, ResourceSpec>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(30),
            breaker: CircuitBreakerConfig::default(),
            autoscale: AutoScalePolicy::default(),
            alerts: AlertThresholds::default(),
            event_capacity: 1024,
            resources: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.autoscale.validate()?;
        self.alerts.validate()?;
        if self.event_capacity == 0 {
            return Err(Error::configuration("event_capacity must be at least 1"));
        }
        for (name, spec) in &self.resources {
            if spec.target.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "resource '{name}': target must not be empty"
                )));
            }
            spec.pool
                .validate()
                .map_err(|e| Error::configuration(format!("resource '{name}': {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn defaults_follow_the_original_pool_settings() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 5);
        assert_eq!(config.max_size, 20);
        assert_eq!(config.hard_ceiling(), 20);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::zero_max(PoolConfig::default().with_size(0, 0), "max_size must be greater")]
    #[case::min_above_max(PoolConfig::default().with_size(6, 5), "min_size (6)")]
    #[case::max_above_hard(PoolConfig::default().with_size(1, 10).with_hard_max(8), "hard_max_size (8)")]
    #[case::zero_idle(PoolConfig::default().with_idle_timeout(Duration::ZERO), "idle_timeout")]
    #[case::zero_lifetime(PoolConfig::default().with_max_lifetime(Duration::ZERO), "max_lifetime")]
    fn rejects_invalid_pool_config(#[case] config: PoolConfig, #[case] needle: &str) {
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn manager_config_parses_resources() {
        let config: ManagerConfig = serde_json::from_value(serde_json::json!({
            "drain_grace": "10s",
            "breaker": { "failure_threshold": 3, "recovery_timeout": "15s" },
            "resources": {
                "orders-db": {
                    "kind": "postgres",
                    "target": "postgres://localhost/orders",
                    "pool": { "min_size": 2, "max_size": 10, "hard_max_size": 40, "idle_timeout": "2m" }
                },
                "tws": { "kind": "tcp", "target": "127.0.0.1:31111" }
            }
        }))
        .unwrap();

        assert_eq!(config.drain_grace, Duration::from_secs(10));
        assert_eq!(config.breaker.failure_threshold, 3);
        let db = &config.resources["orders-db"];
        assert_eq!(db.kind, ResourceKind::Postgres);
        assert_eq!(db.pool.hard_ceiling(), 40);
        assert_eq!(db.pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.resources["tws"].pool, PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn manager_config_names_the_broken_resource() {
        let mut config = ManagerConfig::default();
        config.resources.insert(
            "cache".to_string(),
            ResourceSpec {
                kind: ResourceKind::Redis,
                target: "redis://localhost".to_string(),
                health_path: None,
                pool: PoolConfig::default().with_size(9, 3),
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resource 'cache'"), "{err}");
    }
}
