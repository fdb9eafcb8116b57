//! Client side of the courier sync engine: the outbound send path, the
//! inbound reconciler, the sync coordinator and the UI event stream.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod sync;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::{fmt, EnvFilter};

use courier_store::Database;

pub use config::ClientConfig;
pub use engine::{Recipient, SyncEngine};
pub use error::{ClientError, Result};
pub use events::SyncEvent;

/// The ledger, shared by the send path and the reconciler.
pub type SharedLedger = Arc<Mutex<Database>>;

/// Lock the ledger. Never hold the guard across an `.await`.
pub(crate) fn lock_ledger(db: &SharedLedger) -> Result<MutexGuard<'_, Database>> {
    db.lock().map_err(|_| ClientError::LockPoisoned)
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("courier_client=debug,courier_net=debug,courier_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
