//! Error types.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single exchange or of transport setup.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Server responded with HTTP status {status}")]
    HttpStatus { status: u16 },
    #[error("Server unavailable (retry after {retry_after:?})")]
    Unavailable { retry_after: Option<Duration> },
    #[error("Failed to encode report: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode instruction: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Invalid TLS settings: {0}")]
    InvalidTls(String),
    #[error("Transport closed")]
    Closed,
    #[error("Transport operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Delay the server asked for before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Unavailable { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Error returned by an agent-supplied callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Callback cancelled")]
    Cancelled,
}

impl CallbackError {
    /// Shorthand for [`CallbackError::Rejected`].
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Session lifecycle error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client already started")]
    AlreadyStarted,
    #[error("Client not started")]
    NotStarted,
    #[error("Server address is not set")]
    MissingServerAddress,
    #[error("Callbacks are not set")]
    MissingCallbacks,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}
