//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::types::{ConversationId, ServerMessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Conversation;
use crate::sql;

const CONVERSATION_COLUMNS: &str = "id, kind, participant_ids, last_message_id, last_message_at, \
     unread_count, is_synced, last_sync_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the conversation, creating an empty one if it does not exist.
    pub fn ensure_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        ensure_in(self.conn(), id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        find_in(self.conn(), id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        find_in(self.conn(), id)
    }

    /// All conversations, most recently active first. Conversations without
    /// any message sort last.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             ORDER BY last_message_at DESC NULLS LAST, id ASC"
        ))?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Advance the conversation's last-message pointer.
    ///
    /// The pointer only moves forward in time; an older timestamp leaves the
    /// record untouched. Returns whether the pointer moved.
    pub fn touch_conversation(
        &self,
        id: &ConversationId,
        last_message_id: Option<ServerMessageId>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        ensure_in(self.conn(), id)?;
        touch_in(self.conn(), id, last_message_id, at)
    }

    /// Increment the unread counter, returning the new value.
    pub fn increment_unread(&self, id: &ConversationId) -> Result<u32> {
        ensure_in(self.conn(), id)?;
        increment_unread_in(self.conn(), id)
    }

    /// Zero the unread counter and move every message from other senders
    /// that is `sent` or `delivered` to `read`. Returns how many messages
    /// changed.
    pub fn mark_conversation_read(
        &mut self,
        id: &ConversationId,
        reader: UserId,
    ) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(
            "UPDATE messages
             SET status = 'read', updated_at = ?3
             WHERE conversation_id = ?1
               AND sender_id != ?2
               AND status IN ('sent', 'delivered')",
            params![id.as_str(), reader.0, sql::ts(&Utc::now())],
        )?;
        tx.execute(
            "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;

        tracing::debug!(conversation = %id, changed, "conversation marked read");
        Ok(changed)
    }

    /// Flag the conversation as synced at `at`.
    pub fn mark_conversation_synced(&self, id: &ConversationId, at: DateTime<Utc>) -> Result<()> {
        mark_synced_in(self.conn(), id, at)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove the conversation record. Its messages are left alone; use
    /// [`Database::clear_conversation`] for those.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

pub(crate) fn ensure_in(conn: &Connection, id: &ConversationId) -> Result<Conversation> {
    if let Some(existing) = find_in(conn, id)? {
        return Ok(existing);
    }

    let fresh = Conversation::for_id(id.clone());
    conn.execute(
        "INSERT OR IGNORE INTO conversations (id, kind, participant_ids, unread_count, is_synced)
         VALUES (?1, ?2, ?3, 0, 0)",
        params![
            fresh.id.as_str(),
            fresh.kind.as_str(),
            serde_json::to_string(&fresh.participant_ids)?,
        ],
    )?;
    Ok(fresh)
}

pub(crate) fn find_in(conn: &Connection, id: &ConversationId) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.as_str()],
            row_to_conversation,
        )
        .optional()?)
}

pub(crate) fn touch_in(
    conn: &Connection,
    id: &ConversationId,
    last_message_id: Option<ServerMessageId>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let moved = conn.execute(
        "UPDATE conversations
         SET last_message_at = ?2,
             last_message_id = COALESCE(?3, last_message_id)
         WHERE id = ?1
           AND (last_message_at IS NULL OR last_message_at <= ?2)",
        params![id.as_str(), sql::ts(&at), last_message_id],
    )?;
    Ok(moved > 0)
}

pub(crate) fn mark_synced_in(
    conn: &Connection,
    id: &ConversationId,
    at: DateTime<Utc>,
) -> Result<()> {
    ensure_in(conn, id)?;
    conn.execute(
        "UPDATE conversations SET is_synced = 1, last_sync_at = ?2 WHERE id = ?1",
        params![id.as_str(), sql::ts(&at)],
    )?;
    Ok(())
}

pub(crate) fn increment_unread_in(conn: &Connection, id: &ConversationId) -> Result<u32> {
    let count: u32 = conn.query_row(
        "UPDATE conversations SET unread_count = unread_count + 1
         WHERE id = ?1
         RETURNING unread_count",
        params![id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Map a `rusqlite::Row` (selected with `CONVERSATION_COLUMNS`) to a
/// [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let participants: String = row.get(2)?;
    let last_message_id: Option<i64> = row.get(3)?;
    let last_message_at: Option<String> = row.get(4)?;
    let unread_count: u32 = row.get(5)?;
    let is_synced: bool = row.get(6)?;
    let last_sync_at: Option<String> = row.get(7)?;

    Ok(Conversation {
        id: ConversationId(id),
        kind: sql::parse_enum(1, &kind)?,
        participant_ids: sql::parse_json(2, &participants)?,
        last_message_id,
        last_message_at: sql::parse_opt_ts(4, last_message_at)?,
        unread_count,
        is_synced,
        last_sync_at: sql::parse_opt_ts(7, last_sync_at)?,
    })
}
