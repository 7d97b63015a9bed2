use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::errors::CodecError;
use crate::ports::StoreError;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The store could not be reached at setup. Fatal.
    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Poison payload.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid reference uri, should start with 'gid://': {0}")]
    InvalidReference(String),

    #[error("no entry stored under '{0}'")]
    MissingEntry(String),

    #[error("retries exhausted for '{reference_uri}' after {retries} retries")]
    RetriesExhausted { reference_uri: String, retries: u32 },

    /// NaN and infinities cannot be ordered or decayed.
    #[error("priority of '{reference_uri}' is not a finite number: {priority}")]
    InvalidPriority { reference_uri: String, priority: f64 },

    /// A retry was requested but could not be scheduled, or a handler
    /// invocation blew up.
    #[error("{0}")]
    Retry(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error returned by user handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
