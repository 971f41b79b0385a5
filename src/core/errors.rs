use thiserror::Error;

/// Binance rejects a signed request with this code when its `timestamp` falls
/// outside the receive window.
pub const STALE_TIMESTAMP_CODE: i32 = -1021;

/// Binance's generic UNKNOWN code, used when a reply carries no code of its own.
pub const UNKNOWN_ERROR_CODE: i32 = -1000;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("API error: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("Subscription rejected: {code} - {message}")]
    SubscriptionRejected { code: i32, message: String },

    #[error("No acknowledgement for control request {id} within {timeout_ms}ms")]
    SubscriptionTimeout { id: u64, timeout_ms: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Time synchronisation failed: {0}")]
    TimeSyncFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl ExchangeError {
    /// Numeric server code, when the error originated from a server reply
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ApiError { code, .. } | Self::SubscriptionRejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the server rejected the request because of a stale timestamp
    pub fn is_stale_timestamp(&self) -> bool {
        self.code() == Some(STALE_TIMESTAMP_CODE)
    }
}
