use std::io;

use thiserror::Error;

/// Failures surfaced by the peer transfer engine.
///
/// All of them are terminal for the current session: nothing is retried
/// automatically and the caller has to start a new session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Direct channel closed")]
    ChannelClosed,

    #[error("Failed to read file data: {0}")]
    ReadError(#[from] io::Error),

    #[error("Signaling failed: {0}")]
    Signaling(String),

    #[error("Relay refused the request: {0}")]
    SessionError(String),

    #[error("Connection rejected by sender")]
    SessionRejected,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Protocol(err.to_string())
    }
}
