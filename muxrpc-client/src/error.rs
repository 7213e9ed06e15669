//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] muxrpc_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection lost before the call completed")]
    ConnectionLost,

    #[error("call timed out")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),
}

impl ClientError {
    /// Returns whether the error was reported by the remote handler
    /// rather than by the transport.
    pub fn is_remote(&self) -> bool {
        matches!(self, ClientError::Remote(_))
    }

    /// Returns the remote error message, if any.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            ClientError::Remote(message) => Some(message),
            _ => None,
        }
    }
}
