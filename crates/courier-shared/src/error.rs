use thiserror::Error;

/// Errors raised while encoding or decoding wire frames and identifiers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown frame kind: {0}")]
    UnknownKind(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid conversation id: {0}")]
    InvalidConversationId(String),

    #[error("Unknown message status: {0}")]
    UnknownStatus(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unknown conversation type: {0}")]
    UnknownConversationType(String),
}
