//! Error types and handling for the host portal
//!
//! Operation outcomes never travel through this type: they are reported to
//! completion sinks as [`OpStatus`](crate::core::types::OpStatus) values.
//! `Error` covers the failures of the pool machinery itself.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the host portal
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Endpoint key could not be parsed into host and port
    #[error("Invalid endpoint key: {0}")]
    InvalidEndpoint(String),

    /// The portal context has been shut down
    #[error("Portal context is shut down")]
    ShutDown,

    /// A connection thread could not be started
    #[error("Failed to spawn connection thread: {0}")]
    Spawn(std::io::Error),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid endpoint error
    pub fn invalid_endpoint(key: impl Into<String>) -> Self {
        Self::InvalidEndpoint(key.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if submitting again could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Spawn(_) | Error::Io(_))
    }
}
