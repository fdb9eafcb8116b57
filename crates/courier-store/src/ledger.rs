//! Multi-table writes that must land atomically: a message together with
//! the conversation bookkeeping it implies.

use chrono::Utc;
use tracing::debug;

use courier_shared::types::{ConversationId, MessageStatus, ServerMessageId, UserId};

use crate::conversations;
use crate::database::Database;
use crate::error::Result;
use crate::messages;
use crate::models::{Message, UpsertOutcome};
use crate::sync_state;

/// What applying one inbound message did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundApplied {
    pub outcome: UpsertOutcome,
    /// New unread count when the message raised it.
    pub unread: Option<u32>,
}

/// What applying a catch-up batch for one conversation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchApplied {
    pub outcomes: Vec<UpsertOutcome>,
    /// Unread count after the batch, when it changed.
    pub unread: Option<u32>,
    /// Highest server id seen in the batch.
    pub last_server_id: Option<ServerMessageId>,
}

impl Database {
    /// Persist a freshly composed outgoing message and bump its
    /// conversation, all or nothing.
    pub fn record_outgoing(&mut self, message: &Message) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        messages::insert_in(&tx, message)?;
        conversations::ensure_in(&tx, &message.conversation_id)?;
        conversations::touch_in(&tx, &message.conversation_id, None, message.created_at)?;
        tx.commit()?;

        debug!(
            client_id = %message.client_id,
            conversation = %message.conversation_id,
            "outgoing message recorded"
        );
        Ok(())
    }

    /// Upsert one message pushed by the server and update its conversation.
    ///
    /// The unread counter only grows for messages that are new to the ledger,
    /// were sent by someone other than `local_user` and are not yet read.
    pub fn record_inbound(&mut self, message: &Message, local_user: UserId) -> Result<InboundApplied> {
        let tx = self.conn_mut().transaction()?;
        let applied = apply_inbound_in(&tx, message, local_user)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Apply a catch-up batch for one conversation and write its sync
    /// checkpoint, all or nothing.
    pub fn record_inbound_batch(
        &mut self,
        conversation_id: &ConversationId,
        batch: &[Message],
        local_user: UserId,
    ) -> Result<BatchApplied> {
        let tx = self.conn_mut().transaction()?;
        conversations::ensure_in(&tx, conversation_id)?;

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut unread = None;
        let mut last_server_id: Option<ServerMessageId> = None;
        for message in batch {
            let applied = apply_inbound_in(&tx, message, local_user)?;
            outcomes.push(applied.outcome);
            unread = applied.unread.or(unread);
            last_server_id = last_server_id.max(message.server_id);
        }
        sync_state::record_conversation_sync_in(&tx, conversation_id, last_server_id, Utc::now())?;
        tx.commit()?;

        Ok(BatchApplied {
            outcomes,
            unread,
            last_server_id,
        })
    }
}

fn apply_inbound_in(
    conn: &rusqlite::Connection,
    message: &Message,
    local_user: UserId,
) -> Result<InboundApplied> {
    let outcome = messages::upsert_in(conn, message)?;

    // The stored row may live under a different client id (matched by
    // server id), so bookkeeping follows what is actually persisted.
    let conversation_id = match outcome {
        UpsertOutcome::Inserted => message.conversation_id.clone(),
        _ => {
            let stored = match messages::find_in(conn, &message.client_id)? {
                Some(stored) => Some(stored),
                None => match message.server_id {
                    Some(server_id) => messages::find_by_server_id_in(conn, server_id)?,
                    None => None,
                },
            };
            stored.map_or_else(|| message.conversation_id.clone(), |m| m.conversation_id)
        }
    };

    conversations::ensure_in(conn, &conversation_id)?;
    if outcome != UpsertOutcome::Stale {
        conversations::touch_in(conn, &conversation_id, message.server_id, message.created_at)?;
    }

    let unread = if outcome == UpsertOutcome::Inserted
        && message.sender_id != local_user
        && message.status != MessageStatus::Read
    {
        Some(conversations::increment_unread_in(conn, &conversation_id)?)
    } else {
        None
    };

    Ok(InboundApplied { outcome, unread })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use courier_shared::types::{ClientId, GroupId, MessageType};

    use super::*;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("ledger.db")).unwrap();
        (dir, db)
    }

    fn pushed(client_id: &str, server_id: i64, sender: i64, minute: i64) -> Message {
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap() + Duration::minutes(minute);
        Message {
            client_id: ClientId::from(client_id),
            server_id: Some(server_id),
            conversation_id: ConversationId::group(GroupId(3)),
            sender_id: UserId(sender),
            recipient_id: None,
            group_id: Some(GroupId(3)),
            content: format!("msg {server_id}"),
            message_type: MessageType::Text,
            status: MessageStatus::Delivered,
            version: 1,
            created_at: at,
            updated_at: at,
            is_encrypted: false,
        }
    }

    #[test]
    fn outgoing_creates_conversation() {
        let (_dir, mut db) = open();
        let id = ConversationId::direct(UserId(1), UserId(2));
        let msg = Message::outgoing(id.clone(), UserId(1), Some(UserId(2)), None, "hi".into(), MessageType::Text);

        db.record_outgoing(&msg).unwrap();

        let conv = db.get_conversation(&id).unwrap();
        assert_eq!(conv.last_message_at, Some(msg.created_at));
        assert_eq!(conv.last_message_id, None);
        assert_eq!(conv.unread_count, 0);

        // A duplicate insert leaves nothing half-written.
        assert!(db.record_outgoing(&msg).is_err());
        assert_eq!(db.stats().unwrap().total_messages, 1);

        db.apply_ack(&msg.client_id, 500, MessageStatus::Sent).unwrap();
        assert_eq!(db.get_conversation(&id).unwrap().last_message_id, Some(500));
    }

    #[test]
    fn inbound_counts_unread_once() {
        let (_dir, mut db) = open();
        let me = UserId(1);
        let msg = pushed("x", 10, 2, 0);

        let first = db.record_inbound(&msg, me).unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        assert_eq!(first.unread, Some(1));

        let again = db.record_inbound(&msg, me).unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Updated);
        assert_eq!(again.unread, None);

        let own = db.record_inbound(&pushed("y", 11, 1, 1), me).unwrap();
        assert_eq!(own.unread, None);

        let conv = db.get_conversation(&msg.conversation_id).unwrap();
        assert_eq!(conv.unread_count, 1);
        assert_eq!(conv.last_message_id, Some(11));
    }

    #[test]
    fn batch_writes_checkpoint() {
        let (_dir, mut db) = open();
        let id = ConversationId::group(GroupId(3));
        let batch = vec![pushed("a", 20, 2, 0), pushed("b", 21, 4, 1), pushed("c", 19, 1, -5)];

        let applied = db.record_inbound_batch(&id, &batch, UserId(1)).unwrap();
        assert_eq!(applied.outcomes.len(), 3);
        assert_eq!(applied.unread, Some(2));
        assert_eq!(applied.last_server_id, Some(21));

        let checkpoint = db.conversation_checkpoint(&id).unwrap().unwrap();
        assert_eq!(checkpoint.last_message_id, Some(21));

        // The older message did not rewind the conversation pointer.
        let conv = db.get_conversation(&id).unwrap();
        assert_eq!(conv.last_message_id, Some(21));
        assert!(conv.is_synced);
    }

    #[test]
    fn failed_checkpoint_rolls_back_batch() {
        let (_dir, mut db) = open();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER refuse_checkpoint BEFORE INSERT ON sync_state
                 BEGIN SELECT RAISE(ABORT, 'refused'); END;",
            )
            .unwrap();

        let id = ConversationId::group(GroupId(3));
        let batch = vec![pushed("a", 20, 2, 0)];
        assert!(db.record_inbound_batch(&id, &batch, UserId(1)).is_err());

        assert_eq!(db.stats().unwrap().total_messages, 0);
        assert!(db.find_conversation(&id).unwrap().is_none());
        assert!(db.conversation_checkpoint(&id).unwrap().is_none());
    }

    #[test]
    fn server_copy_after_local_acks_is_not_stale() {
        let (_dir, mut db) = open();
        let me = UserId(1);
        let id = ConversationId::direct(me, UserId(2));
        let mine = Message::outgoing(id, me, Some(UserId(2)), None, "hi".into(), MessageType::Text);
        db.record_outgoing(&mine).unwrap();

        db.apply_ack(&mine.client_id, 30, MessageStatus::Sent).unwrap();
        db.apply_ack(&mine.client_id, 30, MessageStatus::Delivered).unwrap();

        let mut echoed = mine.clone();
        echoed.server_id = Some(30);
        echoed.version = 1;
        echoed.status = MessageStatus::Read;
        let applied = db.record_inbound(&echoed, me).unwrap();
        assert_eq!(applied.outcome, UpsertOutcome::Updated);

        let stored = db.get_message(&mine.client_id).unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.version, 1);
        assert_eq!(stored.server_id, Some(30));
    }
}
