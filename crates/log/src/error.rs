use thiserror::Error;

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LogError {
    /// The filter directive could not be parsed by `EnvFilter`.
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber was already installed in this process.
    #[error("logger already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("unknown log format '{0}', expected pretty, compact or json")]
    UnknownFormat(String),
}

pub type LogResult<T> = Result<T, LogError>;
