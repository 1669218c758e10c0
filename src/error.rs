//! Error types for the Rampart engine.

use thiserror::Error;

/// Main error type for Rampart operations.
///
/// Only `Config` is fatal. Every other variant has a local recovery path
/// inside the engine, and a rate-limit denial is never an error at all: it is
/// returned as [`crate::decision::Decision`] data.
#[derive(Error, Debug)]
pub enum RampartError {
    /// Missing or invalid limit definitions
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not be reached in time
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A client key that does not follow the `kind:id` convention
    #[error("Invalid client identity: {0}")]
    InvalidIdentity(String),

    /// A prediction model could not produce a forecast
    #[error("Prediction failed: {0}")]
    Prediction(String),

    /// A behavior profile snapshot that cannot be restored
    #[error("Invalid profile snapshot: {0}")]
    InvalidSnapshot(String),

    /// The geolocation resolver had no answer for an address
    #[error("Geolocation lookup failed: {0}")]
    GeoLookup(String),

    /// Redis protocol errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RampartError {
    fn from(err: config::ConfigError) -> Self {
        RampartError::Config(err.to_string())
    }
}

/// Result type alias for Rampart operations.
pub type Result<T> = std::result::Result<T, RampartError>;
