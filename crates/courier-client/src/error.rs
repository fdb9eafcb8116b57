use thiserror::Error;

use courier_net::NetError;
use courier_shared::ProtocolError;
use courier_store::StoreError;

/// Errors surfaced to callers of the sync engine.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Local ledger failure; the ledger is left as it was before the call.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A thread panicked while holding the ledger lock.
    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, ClientError>;
