use thiserror::Error;

/// Streaming errors, publisher and viewer side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("malformed frame payload: {0}")]
    Decode(String),

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("stream runtime error: {0}")]
    Runtime(String),
}

impl StreamError {
    /// Socket failures are retried by the viewer; decode failures cost one
    /// frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Socket(_) | Self::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
