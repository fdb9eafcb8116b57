//! Inbound reconciler: applies server frames to the ledger.
//!
//! Frames are handled strictly in arrival order. A malformed frame is logged
//! and dropped; it never stops the session.

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use courier_shared::protocol::{
    AckPayload, ErrorPayload, InboundFrame, ServerMessage, SyncResponsePayload, TypingPayload,
};
use courier_shared::types::{ClientId, MessageStatus, UserId};
use courier_store::{AckOutcome, Message, UpsertOutcome};

use crate::error::Result;
use crate::events::{emit_event, SyncEvent};
use crate::{lock_ledger, SharedLedger};

pub struct Reconciler {
    db: SharedLedger,
    local_user: UserId,
    events: broadcast::Sender<SyncEvent>,
}

impl Reconciler {
    pub fn new(db: SharedLedger, local_user: UserId, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            db,
            local_user,
            events,
        }
    }

    /// Decode and apply one raw frame. Returns whether it was applied.
    pub fn apply_text(&self, text: &str) -> bool {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = text.len(), "dropping malformed frame");
                return false;
            }
        };

        let kind = frame.kind();
        match self.apply(frame) {
            Ok(()) => true,
            Err(e) => {
                error!(kind, error = %e, "failed to apply frame");
                false
            }
        }
    }

    pub fn apply(&self, frame: InboundFrame) -> Result<()> {
        trace!(kind = frame.kind(), "applying frame");
        match frame {
            InboundFrame::Ack(ack) => self.on_ack(ack),
            InboundFrame::Message(message) => self.on_message(message),
            InboundFrame::SyncResponse(batch) => self.on_sync_response(batch),
            InboundFrame::Typing(typing) => {
                self.on_typing(typing);
                Ok(())
            }
            InboundFrame::Error(err) => {
                self.on_server_error(err);
                Ok(())
            }
            // Liveness is tracked by the connection manager.
            InboundFrame::Pong(_) => Ok(()),
        }
    }

    fn on_ack(&self, ack: AckPayload) -> Result<()> {
        let (outcome, stored) = {
            let mut db = lock_ledger(&self.db)?;
            let outcome = db.apply_ack(&ack.client_id, ack.server_id, ack.status)?;
            let stored = db.find_message(&ack.client_id)?;
            (outcome, stored)
        };

        match (outcome, stored) {
            (AckOutcome::Applied { previous, current }, Some(message)) => {
                debug!(
                    client_id = %ack.client_id,
                    server_id = ack.server_id,
                    from = %previous,
                    to = %current,
                    "ack applied"
                );
                emit_event(
                    &self.events,
                    SyncEvent::MessageStatusChanged {
                        client_id: message.client_id,
                        conversation_id: message.conversation_id,
                        server_id: message.server_id,
                        status: current,
                    },
                );
            }
            (AckOutcome::Rejected { current, attempted }, _) => {
                debug!(
                    client_id = %ack.client_id,
                    current = %current,
                    attempted = %attempted,
                    "ack ignored"
                );
            }
            _ => {
                debug!(client_id = %ack.client_id, "ack for unknown message");
            }
        }
        Ok(())
    }

    fn on_message(&self, incoming: ServerMessage) -> Result<()> {
        let message = self.to_ledger(&incoming);
        let applied = lock_ledger(&self.db)?.record_inbound(&message, self.local_user)?;

        if applied.outcome == UpsertOutcome::Stale {
            return Ok(());
        }

        emit_event(
            &self.events,
            SyncEvent::MessageReceived {
                client_id: message.client_id.clone(),
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id,
                is_new: applied.outcome == UpsertOutcome::Inserted,
            },
        );
        if let Some(unread_count) = applied.unread {
            emit_event(
                &self.events,
                SyncEvent::UnreadChanged {
                    conversation_id: message.conversation_id,
                    unread_count,
                },
            );
        }
        Ok(())
    }

    fn on_sync_response(&self, batch: SyncResponsePayload) -> Result<()> {
        let messages: Vec<Message> = batch
            .messages
            .iter()
            .map(|m| {
                let mut message = self.to_ledger(m);
                message.conversation_id = batch.conversation_id.clone();
                message
            })
            .collect();

        let applied = lock_ledger(&self.db)?.record_inbound_batch(
            &batch.conversation_id,
            &messages,
            self.local_user,
        )?;

        let written = applied
            .outcomes
            .iter()
            .filter(|o| **o != UpsertOutcome::Stale)
            .count();
        debug!(
            conversation = %batch.conversation_id,
            received = messages.len(),
            written,
            has_more = batch.has_more,
            "sync batch applied"
        );

        emit_event(
            &self.events,
            SyncEvent::ConversationSynced {
                conversation_id: batch.conversation_id.clone(),
                applied: written,
                has_more: batch.has_more,
            },
        );
        if let Some(unread_count) = applied.unread {
            emit_event(
                &self.events,
                SyncEvent::UnreadChanged {
                    conversation_id: batch.conversation_id,
                    unread_count,
                },
            );
        }
        Ok(())
    }

    fn on_typing(&self, typing: TypingPayload) {
        emit_event(
            &self.events,
            SyncEvent::Typing {
                conversation_id: typing.conversation_id,
                user_id: typing.user_id,
                is_typing: typing.is_typing,
            },
        );
    }

    fn on_server_error(&self, err: ErrorPayload) {
        let code = err.code.map(|c| match c {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        warn!(code = ?code, message = %err.message, "server reported an error");
        emit_event(
            &self.events,
            SyncEvent::ServerError {
                code,
                message: err.message,
            },
        );
    }

    /// Ledger form of a server message. Messages that reach us are at least
    /// `delivered`; a later status in the payload (e.g. `read`) is kept.
    fn to_ledger(&self, incoming: &ServerMessage) -> Message {
        let status = match incoming.status {
            Some(status) => MessageStatus::Delivered.merge(status),
            None => MessageStatus::Delivered,
        };

        Message {
            client_id: incoming
                .resolve_client_id()
                .unwrap_or_else(ClientId::generate),
            server_id: incoming.id,
            conversation_id: incoming.resolve_conversation(self.local_user),
            sender_id: incoming.sender_id,
            recipient_id: incoming.recipient_id,
            group_id: incoming.group_id,
            content: incoming.content.clone(),
            message_type: incoming.message_type,
            status,
            version: incoming.version,
            created_at: incoming.created_at,
            updated_at: Utc::now(),
            is_encrypted: incoming.is_encrypted,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use courier_shared::types::ConversationId;
    use courier_store::Database;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: SharedLedger,
        reconciler: Reconciler,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn fixture(local_user: i64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("ledger.db")).unwrap(),
        ));
        let (tx, rx) = broadcast::channel(64);
        Fixture {
            reconciler: Reconciler::new(db.clone(), UserId(local_user), tx),
            _dir: dir,
            db,
            events: rx,
        }
    }

    fn message_frame(client_id: &str, server_id: i64, content: &str) -> String {
        format!(
            r#"{{"type":"message","payload":{{"id":{server_id},"client_id":"{client_id}",
                "conversation_id":"user_3_7","sender_id":7,"recipient_id":3,
                "content":"{content}","message_type":"text","version":1,
                "created_at":"2024-05-01T10:00:00Z","is_encrypted":false}}}}"#
        )
    }

    #[test]
    fn duplicate_message_frame_keeps_one_record() {
        let mut fx = fixture(3);
        assert!(fx.reconciler.apply_text(&message_frame("c-1", 5, "first")));
        assert!(fx.reconciler.apply_text(&message_frame("c-1", 5, "second")));

        let db = fx.db.lock().unwrap();
        assert_eq!(db.stats().unwrap().total_messages, 1);
        let stored = db.get_message(&ClientId::from("c-1")).unwrap();
        assert_eq!(stored.content, "second");
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert_eq!(
            db.get_conversation(&ConversationId::direct(UserId(3), UserId(7)))
                .unwrap()
                .unread_count,
            1
        );
        drop(db);

        match fx.events.try_recv().unwrap() {
            SyncEvent::MessageReceived { is_new, .. } => assert!(is_new),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn message_without_client_id_gets_synthetic_key() {
        let fx = fixture(3);
        let frame = r#"{"type":"message","payload":{"id":77,"sender_id":7,"recipient_id":3,
            "content":"yo","created_at":1714557600000}}"#;
        assert!(fx.reconciler.apply_text(frame));
        assert!(fx.reconciler.apply_text(frame));

        let db = fx.db.lock().unwrap();
        let stored = db.get_message(&ClientId::from("srv-77")).unwrap();
        assert_eq!(stored.conversation_id.as_str(), "user_3_7");
        assert_eq!(db.stats().unwrap().total_messages, 1);
    }

    #[test]
    fn ack_moves_pending_to_sent() {
        let mut fx = fixture(3);
        let local = Message::outgoing(
            ConversationId::direct(UserId(3), UserId(7)),
            UserId(3),
            Some(UserId(7)),
            None,
            "hi".into(),
            Default::default(),
        );
        fx.db.lock().unwrap().record_outgoing(&local).unwrap();

        let ack = format!(
            r#"{{"type":"ack","payload":{{"client_id":"{}","server_id":42,"status":"sent"}}}}"#,
            local.client_id
        );
        assert!(fx.reconciler.apply_text(&ack));

        let stored = fx.db.lock().unwrap().get_message(&local.client_id).unwrap();
        assert_eq!(stored.server_id, Some(42));
        assert_eq!(stored.status, MessageStatus::Sent);

        assert_eq!(
            fx.events.try_recv().unwrap(),
            SyncEvent::MessageStatusChanged {
                client_id: local.client_id.clone(),
                conversation_id: local.conversation_id.clone(),
                server_id: Some(42),
                status: MessageStatus::Sent,
            }
        );

        // A late, regressing ack changes nothing.
        let stale = format!(
            r#"{{"type":"ack","payload":{{"client_id":"{}","server_id":42,"status":"pending"}}}}"#,
            local.client_id
        );
        assert!(fx.reconciler.apply_text(&stale));
        assert_eq!(
            fx.db.lock().unwrap().get_message(&local.client_id).unwrap().status,
            MessageStatus::Sent
        );
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn ack_for_unknown_client_is_ignored() {
        let fx = fixture(3);
        let ack = r#"{"type":"ack","payload":{"client_id":"elsewhere","server_id":1,"status":"sent"}}"#;
        assert!(fx.reconciler.apply_text(ack));
        assert_eq!(fx.db.lock().unwrap().stats().unwrap().total_messages, 0);
    }

    #[test]
    fn sync_response_inserts_and_advances_conversation() {
        let fx = fixture(3);
        let frame = r#"{"type":"sync_response","payload":{"conversation_id":"user_3_7","messages":[
            {"id":10,"client_id":"a","sender_id":7,"recipient_id":3,"content":"older",
             "created_at":"2024-05-01T10:00:00Z"},
            {"id":11,"client_id":"b","sender_id":3,"recipient_id":7,"content":"newer",
             "created_at":"2024-05-01T10:05:00Z"}
        ],"has_more":false}}"#;
        assert!(fx.reconciler.apply_text(frame));

        let db = fx.db.lock().unwrap();
        assert_eq!(db.stats().unwrap().total_messages, 2);
        assert_eq!(db.get_message(&ClientId::from("a")).unwrap().content, "older");
        assert_eq!(db.get_message(&ClientId::from("b")).unwrap().content, "newer");

        let id = ConversationId::direct(UserId(7), UserId(3));
        let conv = db.get_conversation(&id).unwrap();
        assert_eq!(
            conv.last_message_at.unwrap().to_rfc3339(),
            "2024-05-01T10:05:00+00:00"
        );
        assert_eq!(conv.last_message_id, Some(11));
        assert_eq!(conv.unread_count, 1);
        assert_eq!(
            db.conversation_checkpoint(&id).unwrap().unwrap().last_message_id,
            Some(11)
        );
    }

    #[test]
    fn malformed_and_transient_frames_leave_ledger_alone() {
        let mut fx = fixture(3);
        assert!(!fx.reconciler.apply_text("not json"));
        assert!(!fx.reconciler.apply_text(r#"{"type":"bogus","payload":{}}"#));
        assert!(fx.reconciler.apply_text(r#"{"type":"pong"}"#));
        assert!(fx
            .reconciler
            .apply_text(r#"{"type":"typing","payload":{"conversation_id":"user_3_7","user_id":7}}"#));
        assert!(fx
            .reconciler
            .apply_text(r#"{"type":"error","payload":{"code":429,"message":"slow down"}}"#));

        assert_eq!(fx.db.lock().unwrap().stats().unwrap().total_messages, 0);
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            SyncEvent::Typing { is_typing: true, .. }
        ));
        assert_eq!(
            fx.events.try_recv().unwrap(),
            SyncEvent::ServerError {
                code: Some("429".into()),
                message: "slow down".into(),
            }
        );
    }
}
