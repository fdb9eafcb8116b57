//! Sync coordinator: builds the checkpoint frame sent on every connect.

use chrono::Utc;
use tracing::debug;

use courier_shared::protocol::{OutboundFrame, SyncCheckpoint, SyncPayload};
use courier_store::{Database, StoreError};

/// Checkpoints for every known conversation.
///
/// The checkpoint id is the higher of the conversation's last message id
/// and the id recorded after its last applied `sync_response`.
pub fn collect_checkpoints(db: &Database) -> Result<Vec<SyncCheckpoint>, StoreError> {
    let conversations = db.list_conversations()?;
    let mut checkpoints = Vec::with_capacity(conversations.len());

    for conv in conversations {
        let synced = db
            .conversation_checkpoint(&conv.id)?
            .and_then(|state| state.last_message_id);

        checkpoints.push(SyncCheckpoint {
            conversation_id: conv.id,
            last_message_id: conv.last_message_id.max(synced),
            last_seen_at: conv.last_message_at,
        });
    }

    Ok(checkpoints)
}

/// Build the `sync` frame and record the global checkpoint.
///
/// The frame is produced even with no conversations so the server can push
/// conversations this device has never seen.
pub fn prepare_sync(db: &Database) -> Result<OutboundFrame, StoreError> {
    let conversations = collect_checkpoints(db)?;
    let state = db.record_global_sync(Utc::now())?;

    debug!(
        conversations = conversations.len(),
        pending = state.pending_count,
        "sync frame prepared"
    );
    Ok(OutboundFrame::Sync(SyncPayload { conversations }))
}
