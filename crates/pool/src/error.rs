//! Error types for pool operations
use resync_resilience::{ConfigError, State};
use thiserror::Error;

use crate::connection::ConnectionId;
use crate::manager::ManagerState;

/// Boxed driver error returned by [`Connector`](crate::Connector) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a pool caller can observe.
///
/// Acquire failures carry the resource name, the pool size (active + idle)
/// at the time of failure, the dynamic ceiling and the breaker state.
#[derive(Error, Debug)]
pub enum Error {
    /// No connection became available within the caller's timeout.
    #[error(
        "timed out after {timeout_ms}ms acquiring '{resource}' (pool {pool_size}/{max_size}, circuit {circuit_state})"
    )]
    AcquisitionTimeout {
        resource: String,
        timeout_ms: u64,
        pool_size: usize,
        max_size: usize,
        circuit_state: State,
    },

    /// The breaker rejected the request; do not retry right now.
    #[error(
        "circuit {circuit_state} for '{resource}' (pool {pool_size}/{max_size}), retry after {retry_after_ms:?}ms"
    )]
    CircuitOpen {
        resource: String,
        pool_size: usize,
        max_size: usize,
        circuit_state: State,
        retry_after_ms: Option<u64>,
    },

    /// The driver could not establish a connection, retries included.
    #[error(
        "failed to connect '{resource}' after {attempts} attempt(s) (pool {pool_size}/{max_size}, circuit {circuit_state}): {source}"
    )]
    ConnectionConstruction {
        resource: String,
        attempts: u32,
        pool_size: usize,
        max_size: usize,
        circuit_state: State,
        #[source]
        source: BoxError,
    },

    /// The pool or its manager is draining or stopped, or the connection
    /// was force-closed at the end of the drain grace period.
    #[error("pool '{resource}' is shutting down")]
    ShuttingDown { resource: String },

    /// Caller bug: the lease was already handed back.
    #[error("connection {connection} of '{resource}' was already released")]
    DoubleRelease {
        resource: String,
        connection: ConnectionId,
    },

    /// Caller bug: the lease was used after it was handed back.
    #[error("connection {connection} of '{resource}' was used after release")]
    UseAfterRelease {
        resource: String,
        connection: ConnectionId,
    },

    /// A lease was handed to the manager under another resource's name.
    #[error("connection belongs to '{actual}', not '{expected}'")]
    ForeignConnection { expected: String, actual: String },

    #[error("pool manager is {state}, not running")]
    NotRunning { state: ManagerState },

    #[error("unknown resource '{resource}'")]
    UnknownResource { resource: String },

    #[error(
        "resource '{resource}' is served by connector {registered}, requested {requested}"
    )]
    TypeMismatch {
        resource: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("resource '{resource}' is already registered")]
    DuplicateResource { resource: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn shutting_down(resource: &str) -> Self {
        Self::ShuttingDown {
            resource: resource.to_string(),
        }
    }

    /// Whether retrying the same call later can succeed.
    ///
    /// Policy failures (open circuit, shutdown) and caller bugs are not
    /// retryable; timeouts and driver failures are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout { .. } | Self::ConnectionConstruction { .. }
        )
    }

    /// Get the resource name associated with this error (if any)
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::AcquisitionTimeout { resource, .. }
            | Self::CircuitOpen { resource, .. }
            | Self::ConnectionConstruction { resource, .. }
            | Self::ShuttingDown { resource }
            | Self::DoubleRelease { resource, .. }
            | Self::UseAfterRelease { resource, .. }
            | Self::UnknownResource { resource }
            | Self::TypeMismatch { resource, .. }
            | Self::DuplicateResource { resource } => Some(resource),
            Self::ForeignConnection { expected, .. } => Some(expected),
            Self::NotRunning { .. } | Self::Configuration { .. } => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_errors_name_resource_size_and_circuit() {
        let err = Error::AcquisitionTimeout {
            resource: "orders-db".into(),
            timeout_ms: 100,
            pool_size: 5,
            max_size: 5,
            circuit_state: State::Closed,
        };
        let text = err.to_string();
        assert!(text.contains("orders-db"), "{text}");
        assert!(text.contains("5/5"), "{text}");
        assert!(text.contains("closed"), "{text}");
        assert!(err.is_retryable());
    }

    #[test]
    fn policy_failures_are_not_retryable() {
        let open = Error::CircuitOpen {
            resource: "redis".into(),
            pool_size: 0,
            max_size: 10,
            circuit_state: State::Open,
            retry_after_ms: Some(1500),
        };
        assert!(!open.is_retryable());
        assert!(!Error::shutting_down("redis").is_retryable());
        assert_eq!(open.resource(), Some("redis"));
    }

    #[test]
    fn config_errors_convert() {
        let err: Error = ConfigError::validation("window", "must be positive").into();
        assert!(matches!(err, Error::Configuration { ref message } if message.contains("window")));
        assert_eq!(err.resource(), None);
    }
}
