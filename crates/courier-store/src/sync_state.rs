//! Sync checkpoints: one global `last_sync` row plus one row per
//! conversation keyed `conversation:<id>`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::constants::GLOBAL_SYNC_KEY;
use courier_shared::types::{ConversationId, MessageStatus, ServerMessageId};

use crate::conversations;
use crate::database::Database;
use crate::error::Result;
use crate::messages;
use crate::models::SyncState;
use crate::sql;

const SYNC_COLUMNS: &str = "key, conversation_id, last_message_id, last_sync_at, pending_count";

impl Database {
    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>> {
        get_in(self.conn(), key)
    }

    pub fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        put_in(self.conn(), state)
    }

    pub fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {SYNC_COLUMNS} FROM sync_state ORDER BY key ASC"))?;

        let rows = stmt.query_map([], row_to_sync_state)?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// Checkpoint of the last full sync request, if one was ever sent.
    pub fn global_checkpoint(&self) -> Result<Option<SyncState>> {
        self.get_sync_state(GLOBAL_SYNC_KEY)
    }

    pub fn conversation_checkpoint(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<SyncState>> {
        self.get_sync_state(&conversation_id.sync_key())
    }

    /// Write the global checkpoint with the current pending total.
    pub fn record_global_sync(&self, at: DateTime<Utc>) -> Result<SyncState> {
        let pending = self.count_messages_with_status(MessageStatus::Pending)?;
        let state = SyncState {
            key: GLOBAL_SYNC_KEY.to_string(),
            conversation_id: None,
            last_message_id: None,
            last_sync_at: at,
            pending_count: pending as u32,
        };
        self.put_sync_state(&state)?;
        Ok(state)
    }

    /// Write a conversation checkpoint after its catch-up batch was applied.
    ///
    /// `last_message_id` falls back to the previous checkpoint when the
    /// batch carried no server ids.
    pub fn record_conversation_sync(
        &self,
        conversation_id: &ConversationId,
        last_message_id: Option<ServerMessageId>,
        at: DateTime<Utc>,
    ) -> Result<SyncState> {
        record_conversation_sync_in(self.conn(), conversation_id, last_message_id, at)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

fn get_in(conn: &Connection, key: &str) -> Result<Option<SyncState>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SYNC_COLUMNS} FROM sync_state WHERE key = ?1"),
            params![key],
            row_to_sync_state,
        )
        .optional()?)
}

fn put_in(conn: &Connection, state: &SyncState) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO sync_state ({SYNC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        params![
            state.key,
            state.conversation_id.as_ref().map(|c| c.as_str()),
            state.last_message_id,
            sql::ts(&state.last_sync_at),
            state.pending_count,
        ],
    )?;
    Ok(())
}

pub(crate) fn record_conversation_sync_in(
    conn: &Connection,
    conversation_id: &ConversationId,
    last_message_id: Option<ServerMessageId>,
    at: DateTime<Utc>,
) -> Result<SyncState> {
    let key = conversation_id.sync_key();
    let previous = get_in(conn, &key)?.and_then(|s| s.last_message_id);
    let pending = messages::count_pending_in(conn, conversation_id)?;

    let state = SyncState {
        key,
        conversation_id: Some(conversation_id.clone()),
        last_message_id: match (previous, last_message_id) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        },
        last_sync_at: at,
        pending_count: pending as u32,
    };
    put_in(conn, &state)?;
    conversations::mark_synced_in(conn, conversation_id, at)?;
    Ok(state)
}

fn row_to_sync_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let key: String = row.get(0)?;
    let conversation_id: Option<String> = row.get(1)?;
    let last_message_id: Option<i64> = row.get(2)?;
    let last_sync_at: String = row.get(3)?;
    let pending_count: u32 = row.get(4)?;

    Ok(SyncState {
        key,
        conversation_id: conversation_id.map(ConversationId),
        last_message_id,
        last_sync_at: sql::parse_ts(3, &last_sync_at)?,
        pending_count,
    })
}
