//! Errors surfaced to WebSocket clients as error frames.

use parley_core::error::ChatError;
use std::time::Duration;

pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_ERROR";
pub const HANDLER_TIMEOUT: &str = "HANDLER_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Expected binary data")]
    ExpectedBinary,
    #[error("Malformed envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Unknown message type: {0}")]
    UnknownEvent(String),
    #[error("Unknown subevent {subevent:?} for {event}")]
    UnknownSubevent {
        event: String,
        subevent: Option<String>,
    },
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Handler timeout after {}ms", .0.as_millis())]
    HandlerTimeout(Duration),
    #[error("{0}")]
    Handler(String),
    #[error("Handler was cancelled")]
    Cancelled,
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl GatewayError {
    /// The error-frame `type` this error is reported under.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RateLimited => RATE_LIMIT_ERROR,
            GatewayError::HandlerTimeout(_) => HANDLER_TIMEOUT,
            GatewayError::Chat(e) if e.is_throttled() => RATE_LIMIT_ERROR,
            _ => CONFIGURATION_ERROR,
        }
    }
}
