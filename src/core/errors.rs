use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("API error: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    /// An operation needs API credentials that were not configured.
    /// Raised before any network I/O takes place.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket not connected")]
    NotConnected,

    /// The session was disposed and can no longer be used.
    #[error("Session closed")]
    SessionClosed,

    /// Local refusal: the rate-limit budget is exhausted until `reset_at` (epoch millis).
    #[error("Rate limit exceeded, budget resets at {reset_at}")]
    RateLimitExceeded { reset_at: u64 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),
}

