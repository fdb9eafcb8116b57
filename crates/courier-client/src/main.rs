//! # courier
//!
//! Headless sync client: opens the local ledger, keeps the live connection
//! to the message server up and logs every UI event until Ctrl+C.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use courier_client::{init_tracing, ClientConfig, SyncEngine};
use courier_net::WebSocketConnector;
use courier_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(
        server = %config.server_url,
        user = %config.user_id,
        authenticated = config.token.is_some(),
        "Loaded configuration"
    );

    let db = config.open_database()?;
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Ledger opened");
    }

    let engine = SyncEngine::start(db, Arc::new(WebSocketConnector::new()), &config)?;
    let mut events = engine.subscribe();
    engine.connect()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "sync event"),
                    Err(e) => warn!(error = %e, "unserializable event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    let stats = engine.stats()?;
    info!(
        messages = stats.total_messages,
        pending = stats.pending_messages,
        conversations = stats.conversations,
        "Ledger state at exit"
    );
    engine.disconnect()?;
    engine.shutdown().await?;
    Ok(())
}
