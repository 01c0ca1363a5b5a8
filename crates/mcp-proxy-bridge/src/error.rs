//! Bridge error types.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while bridging two MCP sessions.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Startup configuration is invalid. Fatal for the whole process.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The child process could not be spawned.
    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),

    /// Authentication with the remote server failed after a refresh retry.
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// The remote endpoint could not be reached or refused the session.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The MCP handshake did not complete within the deadline.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Too many non-handshake messages arrived before the session was ready.
    #[error("Handshake queue overflow")]
    HandshakeOverflow,

    /// The peer rejected or mangled the initialize exchange.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A single wire frame could not be parsed. The session continues.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The child process exited while a session was using it.
    #[error("Server process exited: {0}")]
    ChildCrashed(String),

    /// Normal termination: the transport is closed.
    #[error("Transport closed")]
    TransportClosed,

    /// IO error on a transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error on a transport.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BridgeError {
    /// Whether the error is scoped to a single message.
    ///
    /// Per-message errors are logged and dropped; the relay continues.
    /// Everything else terminates the owning bridge.
    pub fn is_per_message(&self) -> bool {
        matches!(self, BridgeError::MalformedMessage(_))
    }

    /// Whether the error is ordinary end-of-session rather than a failure.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, BridgeError::TransportClosed)
    }
}
