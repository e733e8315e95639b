//! Error types for the wire layer.

use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The socket is not connected or the connection has been disposed.
    #[error("Not connected")]
    NotConnected,
    /// An encrypted send was requested before a handshake completed.
    #[error("Encryption is not established on this connection")]
    EncryptionNotEstablished,
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// Correlatable messages cannot be broadcast.
    #[error("Invalid broadcast: {0}")]
    InvalidBroadcast(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Registry is not started")]
    NotStarted,
    /// The connection already reports to a different registry.
    #[error("Connection is tracked by another registry")]
    AlreadyTracked,
}

impl From<rsa::Error> for WireError {
    fn from(e: rsa::Error) -> Self {
        WireError::Crypto(e.to_string())
    }
}
