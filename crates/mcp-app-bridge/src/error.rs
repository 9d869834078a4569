//! Bridge error types.

use thiserror::Error;

/// Bridge error type.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("guest channel closed")]
    ChannelClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("proxy unavailable: {0}")]
    ProxyUnavailable(String),

    #[error("unauthorized proxy request")]
    Unauthorized,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bridge result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
