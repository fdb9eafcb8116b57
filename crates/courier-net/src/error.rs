use thiserror::Error;

use courier_shared::ProtocolError;

/// Failures of the underlying duplex link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The handshake request could not be built (bad URL or header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The link is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned by [`ConnectionHandle`](crate::ConnectionHandle) calls.
#[derive(Error, Debug)]
pub enum NetError {
    /// The connection task has shut down.
    #[error("connection task is no longer running")]
    ActorGone,

    /// An outbound frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
