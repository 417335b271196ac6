//! Streaming client error types
//!
//! One error enum covers the whole client. Runtime errors raised by the
//! reader are additionally classified by [`StreamError::disposition`] so the
//! processor can decide between a clean shutdown and a reconnect.

use thiserror::Error;

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code sent by a peer that is going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Pseudo close code for a connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Streaming client errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Frame too short: needed {needed} bytes, got {actual}")]
    FrameTooShort { needed: usize, actual: usize },

    #[error("Unsupported payload format: {0}")]
    UnsupportedPayloadFormat(u8),

    #[error("Connection closed by peer (code {code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Socket already closed")]
    SocketClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Subscription request failed with status {status}: {body}")]
    SubscriptionFailed { status: u16, body: String },

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Reconnection gave up after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// What the processor should do with a runtime error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Peer closed normally; shut down without reconnecting
    CleanShutdown,
    /// Connection was lost; queue a reconnection request
    Reconnect,
    /// The socket was already torn down locally; nothing left to do
    AlreadyClosed,
}

impl StreamError {
    /// Classify an error reported by the reader
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            StreamError::ConnectionClosed { code, .. } if *code == CLOSE_NORMAL => {
                ErrorDisposition::CleanShutdown
            }
            StreamError::SocketClosed => ErrorDisposition::AlreadyClosed,
            _ => ErrorDisposition::Reconnect,
        }
    }

    /// Whether the error aborts `connect` before any worker is started
    pub fn is_fatal_to_connect(&self) -> bool {
        matches!(
            self,
            StreamError::NotAuthenticated
                | StreamError::AuthenticationFailed(_)
                | StreamError::HandshakeFailed(_)
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
