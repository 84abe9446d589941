//! Error types for the Stripe fetch provider.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for the provider surface.
pub type Result<T> = std::result::Result<T, FetcherError>;

/// Result of one logical fetch.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Errors raised while validating connection parameters.
///
/// These are always raised before a client is acquired and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Fetcher config is missing")]
    MissingConfig,

    #[error("Missing or empty credential (api_key)")]
    MissingCredential,

    #[error("Invalid retry count: {value}")]
    InvalidRetryCount { value: String },

    #[error("Invalid log level: {value}")]
    InvalidLogLevel { value: String },

    #[error("Invalid telemetry flag: {value}")]
    InvalidTelemetryFlag { value: String },

    #[error("Unknown connection parameter: {field}")]
    UnknownField { field: String }
}

/// Transport-level failure of a single page request.
///
/// The executor decides from [`ProviderError::is_transient`] whether the
/// request is attempted again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Rate limited by provider")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("Provider unavailable: {status} - {message}")]
    Unavailable { status: u16, message: String },

    #[error("Authentication failed: {message}")]
    Unauthorized { message: String },

    #[error("Bad request: {status} - {message}")]
    BadRequest { status: u16, message: String },

    #[error("Resource not found: {message}")]
    NotFound { message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String }
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        if let Self::RateLimited {
            retry_after_seconds: Some(seconds)
        } = self
        {
            Some(Duration::from_secs(*seconds))
        } else {
            None
        }
    }
}

/// Errors surfaced by one logical fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Unsupported resource: {name}")]
    UnsupportedResource { name: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ProviderError
    },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Malformed page: {message}")]
    MalformedPage { message: String },

    #[error("Page limit of {limit} exceeded")]
    PageLimitExceeded { limit: usize },

    #[error("Client initialization failed: {message}")]
    ClientInit { message: String }
}

impl FetchError {
    /// Maps a non-transient provider error to its fetch-level kind.
    pub(crate) fn permanent(err: ProviderError) -> Self {
        match err {
            ProviderError::Unauthorized { message } => Self::Unauthorized { message },
            ProviderError::NotFound { message } => Self::NotFound { message },
            ProviderError::BadRequest { status, message } => Self::BadRequest {
                message: format!("{status}: {message}")
            },
            ProviderError::MalformedResponse { message } => Self::MalformedPage { message },
            transient => Self::RetriesExhausted {
                attempts: 1,
                source: transient
            }
        }
    }
}

/// Top-level error of the fetch provider.
#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError)
}
