//! Error types for the Keystone resilience layer

use std::time::Duration;
use thiserror::Error;

use crate::health::OperatingMode;

/// Result type alias for resilience-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Every fallback tier was exhausted for a data request.
    #[error("Data unavailable for {key} (operating mode: {mode})")]
    DataUnavailable { key: String, mode: OperatingMode },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation failed: {0}")]
    Other(String),
}

impl Error {
    /// Whether the error is transient and safe to retry with backoff.
    ///
    /// Only breaker rejections, call timeouts and upstream rate limiting
    /// qualify; everything else is returned to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Breaker(BreakerError::Open)
                | Error::Breaker(BreakerError::TooManyCalls)
                | Error::Breaker(BreakerError::Timeout(_))
                | Error::Api(ApiError::RateLimit(_))
        )
    }
}

/// Circuit breaker rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError {
    #[error("Circuit breaker is open")]
    Open,

    #[error("Too many concurrent calls while circuit is half-open")]
    TooManyCalls,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Upstream API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed. Check the configured API token.")]
    Unauthorized,

    #[error("Access denied. The token does not have permission to access this resource.")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded. Retry after {0:?}")]
    RateLimit(Duration),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid API response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Network("Request timed out".to_string())
        } else if err.is_connect() {
            ApiError::Network("Failed to connect to upstream service".to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Cache and embedded-store errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache I/O error: {0}")]
    Io(String),

    #[error("Could not determine cache directory")]
    NoHome,

    #[error("Failed to serialize cache value: {0}")]
    Serialization(String),

    #[error("Remote cache error: {0}")]
    Remote(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Priority queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue is shutting down")]
    Shutdown,

    #[error("Request {0} was dropped before producing a result")]
    Dropped(String),
}
