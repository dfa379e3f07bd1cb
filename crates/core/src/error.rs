//! Error types for the chat-completion side of the core crate.

/// Errors raised while talking to upstream chat-completion endpoints or
/// managing conversation history.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("No upstream endpoints are configured")]
    NoEndpoints,
    #[error("Unknown conversation session: {0}")]
    UnknownSession(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("Upstream response contained no message content")]
    EmptyResponse,
    #[error("Endpoint {endpoint} still throttled after {attempts} attempts")]
    Throttled { endpoint: String, attempts: u32 },
    #[error("Failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether the error came from upstream rate limiting.
    pub fn is_throttled(&self) -> bool {
        matches!(self, ChatError::Throttled { .. })
    }
}
