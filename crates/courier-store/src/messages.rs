//! Message table: optimistic inserts, acknowledgements and the idempotent
//! upsert used for every inbound copy of a message.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use courier_shared::types::{
    ClientId, ConversationId, GroupId, MessageStatus, ServerMessageId, UserId,
};

use crate::conversations;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{AckOutcome, Message, UpsertOutcome};
use crate::sql;

const MESSAGE_COLUMNS: &str = "client_id, server_id, conversation_id, sender_id, recipient_id, \
     group_id, content, message_type, status, version, created_at, updated_at, is_encrypted";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message. Fails with [`StoreError::DuplicateClientId`] if
    /// the client id is already present.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        insert_in(self.conn(), message)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, client_id: &ClientId) -> Result<Message> {
        find_in(self.conn(), client_id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_message(&self, client_id: &ClientId) -> Result<Option<Message>> {
        find_in(self.conn(), client_id)
    }

    pub fn get_message_by_server_id(&self, server_id: ServerMessageId) -> Result<Message> {
        find_by_server_id_in(self.conn(), server_id)?.ok_or(StoreError::NotFound)
    }

    /// One page of a conversation's history, newest first.
    pub fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Every `pending` message, oldest first.
    pub fn get_pending_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map([], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages_with_status(&self, status: MessageStatus) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_pending_in_conversation(&self, conversation_id: &ConversationId) -> Result<u64> {
        count_pending_in(self.conn(), conversation_id)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Move a message to `next` if that is a forward transition.
    ///
    /// Returns `false` (and leaves the row untouched) for invalid or no-op
    /// transitions.
    pub fn set_message_status(&self, client_id: &ClientId, next: MessageStatus) -> Result<bool> {
        let current = self.get_message(client_id)?;
        if !current.status.can_transition_to(next) {
            warn!(
                client_id = %client_id,
                from = %current.status,
                to = %next,
                "rejected status transition"
            );
            return Ok(false);
        }

        self.conn().execute(
            "UPDATE messages SET status = ?2, updated_at = ?3 WHERE client_id = ?1",
            params![client_id.as_str(), next.as_str(), sql::ts(&Utc::now())],
        )?;
        Ok(true)
    }

    /// Record a server acknowledgement for a locally originated message.
    ///
    /// The server id is assigned only if none is stored yet; the status only
    /// moves forward. `version` is left alone: it only ever carries the
    /// server's copy number, which inbound upserts compare against.
    pub fn apply_ack(
        &mut self,
        client_id: &ClientId,
        server_id: ServerMessageId,
        status: MessageStatus,
    ) -> Result<AckOutcome> {
        let tx = self.conn_mut().transaction()?;

        let Some(current) = find_in(&tx, client_id)? else {
            return Ok(AckOutcome::Unknown);
        };

        let resolved_server_id = resolve_server_id(&tx, &current, Some(server_id))?;

        let (next_status, outcome) = if current.status == status {
            (
                current.status,
                AckOutcome::Applied {
                    previous: current.status,
                    current: current.status,
                },
            )
        } else if current.status.can_transition_to(status) {
            (
                status,
                AckOutcome::Applied {
                    previous: current.status,
                    current: status,
                },
            )
        } else {
            warn!(
                client_id = %client_id,
                from = %current.status,
                to = %status,
                "ack would regress message status, keeping current"
            );
            (
                current.status,
                AckOutcome::Rejected {
                    current: current.status,
                    attempted: status,
                },
            )
        };

        if resolved_server_id != current.server_id || next_status != current.status {
            tx.execute(
                "UPDATE messages
                 SET server_id = ?2, status = ?3, updated_at = ?4
                 WHERE client_id = ?1",
                params![
                    client_id.as_str(),
                    resolved_server_id,
                    next_status.as_str(),
                    sql::ts(&Utc::now()),
                ],
            )?;
            conversations::touch_in(
                &tx,
                &current.conversation_id,
                resolved_server_id,
                current.created_at,
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Insert-or-update a single message. See [`upsert_in`] for the rules.
    pub fn upsert_message(&mut self, message: &Message) -> Result<UpsertOutcome> {
        let tx = self.conn_mut().transaction()?;
        let outcome = upsert_in(&tx, message)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Upsert many messages atomically: either all are applied or none.
    pub fn batch_upsert_messages(&mut self, messages: &[Message]) -> Result<Vec<UpsertOutcome>> {
        let tx = self.conn_mut().transaction()?;
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(upsert_in(&tx, message)?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete every message of a conversation and reset its pointers.
    /// Returns the number of messages removed.
    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let removed = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        tx.execute(
            "UPDATE conversations
             SET last_message_id = NULL, last_message_at = NULL, unread_count = 0
             WHERE id = ?1",
            params![conversation_id.as_str()],
        )?;
        tx.commit()?;

        debug!(conversation = %conversation_id, removed, "conversation cleared");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

pub(crate) fn insert_in(conn: &Connection, message: &Message) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            message.client_id.as_str(),
            message.server_id,
            message.conversation_id.as_str(),
            message.sender_id.0,
            message.recipient_id.map(|u| u.0),
            message.group_id.map(|g| g.0),
            message.content,
            message.message_type.as_str(),
            message.status.as_str(),
            message.version,
            sql::ts(&message.created_at),
            sql::ts(&message.updated_at),
            message.is_encrypted,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::DuplicateClientId(message.client_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn find_in(conn: &Connection, client_id: &ClientId) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_id = ?1"),
            params![client_id.as_str()],
            row_to_message,
        )
        .optional()?)
}

pub(crate) fn find_by_server_id_in(
    conn: &Connection,
    server_id: ServerMessageId,
) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE server_id = ?1"),
            params![server_id],
            row_to_message,
        )
        .optional()?)
}

/// Decide which server id `current` ends up with when `incoming` is observed.
/// A stored id is never replaced, and an id owned by another row is refused.
fn resolve_server_id(
    conn: &Connection,
    current: &Message,
    incoming: Option<ServerMessageId>,
) -> Result<Option<ServerMessageId>> {
    match (current.server_id, incoming) {
        (Some(kept), Some(other)) if kept != other => {
            warn!(
                client_id = %current.client_id,
                kept,
                ignored = other,
                "server id already assigned, ignoring new one"
            );
            Ok(Some(kept))
        }
        (Some(kept), _) => Ok(Some(kept)),
        (None, Some(new_id)) => match find_by_server_id_in(conn, new_id)? {
            Some(owner) if owner.client_id != current.client_id => {
                warn!(
                    client_id = %current.client_id,
                    owner = %owner.client_id,
                    server_id = new_id,
                    "server id belongs to another message, not assigning"
                );
                Ok(None)
            }
            _ => Ok(Some(new_id)),
        },
        (None, None) => Ok(None),
    }
}

pub(crate) fn count_pending_in(conn: &Connection, conversation_id: &ConversationId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND status = 'pending'",
        params![conversation_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Idempotent insert-or-update.
///
/// The existing row is looked up by client id, then by server id. When none
/// exists the message is inserted. Otherwise the incoming copy overwrites the
/// row unless its `version` is older, with these fields protected:
/// - `client_id` and `conversation_id` never change,
/// - `server_id` is kept once set,
/// - `status` only moves forward.
pub(crate) fn upsert_in(conn: &Connection, incoming: &Message) -> Result<UpsertOutcome> {
    let existing = match find_in(conn, &incoming.client_id)? {
        Some(found) => Some(found),
        None => match incoming.server_id {
            Some(server_id) => find_by_server_id_in(conn, server_id)?,
            None => None,
        },
    };

    let Some(current) = existing else {
        insert_in(conn, incoming)?;
        return Ok(UpsertOutcome::Inserted);
    };

    if incoming.version < current.version {
        debug!(
            client_id = %current.client_id,
            stored = current.version,
            incoming = incoming.version,
            "skipping stale message copy"
        );
        return Ok(UpsertOutcome::Stale);
    }

    let merged = Message {
        client_id: current.client_id.clone(),
        server_id: resolve_server_id(conn, &current, incoming.server_id)?,
        conversation_id: current.conversation_id.clone(),
        sender_id: incoming.sender_id,
        recipient_id: incoming.recipient_id.or(current.recipient_id),
        group_id: incoming.group_id.or(current.group_id),
        content: incoming.content.clone(),
        message_type: incoming.message_type,
        status: current.status.merge(incoming.status),
        version: incoming.version,
        created_at: incoming.created_at,
        updated_at: Utc::now(),
        is_encrypted: incoming.is_encrypted,
    };

    conn.execute(
        "UPDATE messages
         SET server_id = ?2, sender_id = ?3, recipient_id = ?4, group_id = ?5, content = ?6,
             message_type = ?7, status = ?8, version = ?9, created_at = ?10, updated_at = ?11,
             is_encrypted = ?12
         WHERE client_id = ?1",
        params![
            merged.client_id.as_str(),
            merged.server_id,
            merged.sender_id.0,
            merged.recipient_id.map(|u| u.0),
            merged.group_id.map(|g| g.0),
            merged.content,
            merged.message_type.as_str(),
            merged.status.as_str(),
            merged.version,
            sql::ts(&merged.created_at),
            sql::ts(&merged.updated_at),
            merged.is_encrypted,
        ],
    )?;

    Ok(UpsertOutcome::Updated)
}

/// Map a `rusqlite::Row` (selected with `MESSAGE_COLUMNS`) to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let client_id: String = row.get(0)?;
    let server_id: Option<i64> = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let sender_id: i64 = row.get(3)?;
    let recipient_id: Option<i64> = row.get(4)?;
    let group_id: Option<i64> = row.get(5)?;
    let content: String = row.get(6)?;
    let message_type: String = row.get(7)?;
    let status: String = row.get(8)?;
    let version: i64 = row.get(9)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;
    let is_encrypted: bool = row.get(12)?;

    Ok(Message {
        client_id: ClientId(client_id),
        server_id,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        recipient_id: recipient_id.map(UserId),
        group_id: group_id.map(GroupId),
        content,
        message_type: sql::parse_enum(7, &message_type)?,
        status: sql::parse_enum(8, &status)?,
        version,
        created_at: sql::parse_ts(10, &created_str)?,
        updated_at: sql::parse_ts(11, &updated_str)?,
        is_encrypted,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use courier_shared::types::MessageType;

    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("ledger.db")).unwrap();
        (dir, db)
    }

    fn conv() -> ConversationId {
        ConversationId::direct(UserId(3), UserId(7))
    }

    fn outgoing(content: &str) -> Message {
        Message::outgoing(
            conv(),
            UserId(3),
            Some(UserId(7)),
            None,
            content.to_string(),
            MessageType::Text,
        )
    }

    fn inbound(client_id: &str, server_id: i64, content: &str, version: i64) -> Message {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Message {
            client_id: ClientId::from(client_id),
            server_id: Some(server_id),
            conversation_id: conv(),
            sender_id: UserId(7),
            recipient_id: Some(UserId(3)),
            group_id: None,
            content: content.to_string(),
            message_type: MessageType::Text,
            status: MessageStatus::Delivered,
            version,
            created_at: at,
            updated_at: at,
            is_encrypted: false,
        }
    }

    #[test]
    fn insert_and_get() {
        let (_dir, db) = open();
        let msg = outgoing("hi");
        db.insert_message(&msg).unwrap();

        let loaded = db.get_message(&msg.client_id).unwrap();
        assert_eq!(loaded.content, "hi");
        assert_eq!(loaded.status, MessageStatus::Pending);
        assert_eq!(loaded.server_id, None);
        assert_eq!(loaded.conversation_id, conv());

        assert!(matches!(
            db.insert_message(&msg),
            Err(StoreError::DuplicateClientId(_))
        ));
        assert!(matches!(
            db.get_message(&ClientId::from("missing")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn ack_assigns_server_id_once() {
        let (_dir, mut db) = open();
        let msg = outgoing("hi");
        db.insert_message(&msg).unwrap();

        let outcome = db.apply_ack(&msg.client_id, 42, MessageStatus::Sent).unwrap();
        assert_eq!(
            outcome,
            AckOutcome::Applied {
                previous: MessageStatus::Pending,
                current: MessageStatus::Sent,
            }
        );

        let loaded = db.get_message(&msg.client_id).unwrap();
        assert_eq!(loaded.server_id, Some(42));
        assert_eq!(loaded.status, MessageStatus::Sent);
        assert_eq!(loaded.version, 0);
        assert_eq!(db.get_message_by_server_id(42).unwrap().client_id, msg.client_id);

        // A second ack with a different id does not reassign it.
        db.apply_ack(&msg.client_id, 99, MessageStatus::Delivered).unwrap();
        let loaded = db.get_message(&msg.client_id).unwrap();
        assert_eq!(loaded.server_id, Some(42));
        assert_eq!(loaded.status, MessageStatus::Delivered);
    }

    #[test]
    fn ack_never_regresses_status() {
        let (_dir, mut db) = open();
        let msg = outgoing("hi");
        db.insert_message(&msg).unwrap();
        db.apply_ack(&msg.client_id, 1, MessageStatus::Read).unwrap();

        let outcome = db.apply_ack(&msg.client_id, 1, MessageStatus::Pending).unwrap();
        assert_eq!(
            outcome,
            AckOutcome::Rejected {
                current: MessageStatus::Read,
                attempted: MessageStatus::Pending,
            }
        );
        assert_eq!(db.get_message(&msg.client_id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn failed_is_terminal() {
        let (_dir, mut db) = open();
        let msg = outgoing("hi");
        db.insert_message(&msg).unwrap();

        assert!(db.set_message_status(&msg.client_id, MessageStatus::Failed).unwrap());
        assert!(!db.set_message_status(&msg.client_id, MessageStatus::Sent).unwrap());

        let outcome = db.apply_ack(&msg.client_id, 5, MessageStatus::Sent).unwrap();
        assert!(matches!(outcome, AckOutcome::Rejected { .. }));
        assert_eq!(db.get_message(&msg.client_id).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn ack_for_unknown_client_id_is_noop() {
        let (_dir, mut db) = open();
        let outcome = db
            .apply_ack(&ClientId::from("other-device"), 7, MessageStatus::Sent)
            .unwrap();
        assert_eq!(outcome, AckOutcome::Unknown);
        assert_eq!(db.stats().unwrap().total_messages, 0);
    }

    #[test]
    fn upsert_same_client_id_twice_keeps_one_row() {
        let (_dir, mut db) = open();

        let first = inbound("c-1", 10, "first", 1);
        let second = inbound("c-1", 10, "second", 1);

        assert_eq!(db.upsert_message(&first).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(db.upsert_message(&second).unwrap(), UpsertOutcome::Updated);

        assert_eq!(db.stats().unwrap().total_messages, 1);
        assert_eq!(db.get_message(&ClientId::from("c-1")).unwrap().content, "second");
    }

    #[test]
    fn upsert_matches_by_server_id() {
        let (_dir, mut db) = open();
        let local = outgoing("mine");
        db.insert_message(&local).unwrap();
        db.apply_ack(&local.client_id, 77, MessageStatus::Sent).unwrap();

        // Echo of our own message without the client id.
        let mut echo = inbound("srv-77", 77, "mine", 1);
        echo.sender_id = UserId(3);
        assert_eq!(db.upsert_message(&echo).unwrap(), UpsertOutcome::Updated);

        assert_eq!(db.stats().unwrap().total_messages, 1);
        let stored = db.get_message(&local.client_id).unwrap();
        assert_eq!(stored.server_id, Some(77));
        assert_eq!(stored.status, MessageStatus::Delivered);
    }

    #[test]
    fn upsert_skips_stale_versions_and_protects_fields() {
        let (_dir, mut db) = open();

        let mut newer = inbound("c-1", 10, "v3", 3);
        newer.status = MessageStatus::Read;
        db.upsert_message(&newer).unwrap();

        let older = inbound("c-1", 10, "v2", 2);
        assert_eq!(db.upsert_message(&older).unwrap(), UpsertOutcome::Stale);
        assert_eq!(db.get_message(&ClientId::from("c-1")).unwrap().content, "v3");

        let mut same = inbound("c-1", 11, "v3-again", 3);
        same.conversation_id = ConversationId::group(GroupId(1));
        db.upsert_message(&same).unwrap();

        let stored = db.get_message(&ClientId::from("c-1")).unwrap();
        assert_eq!(stored.content, "v3-again");
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.server_id, Some(10));
        assert_eq!(stored.conversation_id, conv());
    }

    #[test]
    fn batch_upsert_is_atomic() {
        let (_dir, mut db) = open();
        db.insert_message(&outgoing("pending")).unwrap();

        let a = inbound("a", 1, "a", 1);
        let b = inbound("b", 2, "b", 1);
        let outcomes = db.batch_upsert_messages(&[a, b]).unwrap();
        assert_eq!(outcomes, vec![UpsertOutcome::Inserted, UpsertOutcome::Inserted]);
        assert_eq!(db.stats().unwrap().total_messages, 3);

        // A failing row rolls the whole batch back.
        let c = inbound("c", 3, "c", 1);
        let broken = inbound("d", 4, "d", 1);
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_d BEFORE INSERT ON messages
                 WHEN NEW.client_id = 'd'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        assert!(db.batch_upsert_messages(&[c, broken]).is_err());
        assert!(db.find_message(&ClientId::from("c")).unwrap().is_none());
        assert_eq!(db.stats().unwrap().total_messages, 3);
    }

    #[test]
    fn conversation_history_is_paged_newest_first() {
        let (_dir, db) = open();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            let mut msg = outgoing(&format!("m{i}"));
            msg.created_at = base + Duration::minutes(i);
            db.insert_message(&msg).unwrap();
        }

        let page = db.get_conversation_messages(&conv(), 2, 0).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3"]);

        let page = db.get_conversation_messages(&conv(), 2, 4).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "m0");

        let pending = db.get_pending_messages().unwrap();
        assert_eq!(pending.first().unwrap().content, "m0");
        assert_eq!(db.count_messages_with_status(MessageStatus::Pending).unwrap(), 5);
        assert_eq!(db.count_pending_in_conversation(&conv()).unwrap(), 5);
    }

    #[test]
    fn clear_conversation_removes_only_its_messages() {
        let (_dir, mut db) = open();
        db.insert_message(&outgoing("a")).unwrap();
        let mut other = outgoing("b");
        other.conversation_id = ConversationId::group(GroupId(2));
        db.insert_message(&other).unwrap();

        assert_eq!(db.clear_conversation(&conv()).unwrap(), 1);
        assert_eq!(db.stats().unwrap().total_messages, 1);
        assert!(db.find_message(&other.client_id).unwrap().is_some());
    }
}
