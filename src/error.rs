use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Exchange Errors
    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Exchange rate limit exceeded (retry after {retry_after:?})")]
    RateLimitExceeded {
        retry_after: Option<Duration>,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Normalization Errors
    #[error("Normalization failed: {0}")]
    NormalizationError(String),

    // Configuration Errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Storage Errors
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    // IO Errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes the scheduler reasons about when choosing between retry
/// and the terminal FAILED state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    ExchangeThrottled,
    MalformedResponse,
    NormalizationError,
    InvalidConfiguration,
    StorageFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ExchangeThrottled => "exchange_throttled",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::NormalizationError => "normalization_error",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::StorageFailure => "storage_failure",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ExchangeUnavailable(_) => ErrorKind::TransientNetwork,
            Error::RateLimitExceeded { .. } => ErrorKind::ExchangeThrottled,
            Error::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Error::NormalizationError(_) => ErrorKind::NormalizationError,
            Error::InvalidRequest(_)
            | Error::InvalidConfiguration(_)
            | Error::ConfigError(_) => ErrorKind::InvalidConfiguration,
            Error::StorageFailure(_) | Error::IoError(_) => ErrorKind::StorageFailure,
        }
    }

    /// Whether repeating the same operation may succeed.
    ///
    /// A page that failed to decode is assumed to be a truncated or garbled
    /// transfer and is retried; a page that decoded but carries invalid
    /// candle fields will come back identical and is not.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::TransientNetwork
            | ErrorKind::ExchangeThrottled
            | ErrorKind::MalformedResponse
            | ErrorKind::StorageFailure => true,
            ErrorKind::NormalizationError | ErrorKind::InvalidConfiguration => false,
        }
    }

    /// Minimum wait the exchange asked for before the next request.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::StorageFailure(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Error::MalformedResponse(error.to_string())
        } else if error.is_builder() {
            Error::InvalidRequest(error.to_string())
        } else {
            Error::ExchangeUnavailable(error.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::ConfigError(error.to_string())
    }
}
