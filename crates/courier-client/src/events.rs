use serde::Serialize;
use tokio::sync::broadcast;

use courier_shared::types::{
    ClientId, ConnectionStatus, ConversationId, MessageStatus, ServerMessageId, UserId,
};

/// Capacity of the UI event channel; slow subscribers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Changes the UI layer can react to. Everything the engine reconciles into
/// the ledger is announced here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectionChanged {
        status: ConnectionStatus,
    },
    /// The connection gave up reconnecting; call `connect` to try again.
    RetriesExhausted {
        attempts: u32,
    },
    /// An outgoing message was written to the ledger and handed to the queue.
    MessageQueued {
        client_id: ClientId,
        conversation_id: ConversationId,
    },
    MessageStatusChanged {
        client_id: ClientId,
        conversation_id: ConversationId,
        server_id: Option<ServerMessageId>,
        status: MessageStatus,
    },
    /// An inbound message was inserted or refreshed.
    MessageReceived {
        client_id: ClientId,
        conversation_id: ConversationId,
        sender_id: UserId,
        is_new: bool,
    },
    ConversationSynced {
        conversation_id: ConversationId,
        applied: usize,
        has_more: bool,
    },
    Typing {
        conversation_id: Option<ConversationId>,
        user_id: UserId,
        is_typing: bool,
    },
    /// Error reported by the server; the ledger is untouched.
    ServerError {
        code: Option<String>,
        message: String,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread_count: u32,
    },
}

pub fn event_channel() -> broadcast::Sender<SyncEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Publish an event. Having no subscribers is not an error.
pub fn emit_event(events: &broadcast::Sender<SyncEvent>, event: SyncEvent) {
    if events.send(event).is_err() {
        tracing::trace!("no event subscribers");
    }
}
