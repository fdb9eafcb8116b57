//! Domain model structs persisted in the local ledger.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::types::{
    ClientId, ConversationId, ConversationKey, ConversationType, GroupId, MessageStatus,
    MessageType, ServerMessageId, UserId,
};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message, keyed by its locally generated client id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Primary key, stable from the moment the message is created.
    pub client_id: ClientId,
    /// Server-assigned id; set at most once.
    pub server_id: Option<ServerMessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Set for direct messages.
    pub recipient_id: Option<UserId>,
    /// Set for group messages.
    pub group_id: Option<GroupId>,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    /// Bumped on every server-confirmed update; used to spot stale overwrites.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_encrypted: bool,
}

impl Message {
    /// A freshly composed outgoing message in `pending` state.
    pub fn outgoing(
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient_id: Option<UserId>,
        group_id: Option<GroupId>,
        content: String,
        message_type: MessageType,
    ) -> Self {
        // Ledger timestamps carry millisecond precision.
        let now = Utc::now().trunc_subsecs(3);
        Self {
            client_id: ClientId::generate(),
            server_id: None,
            conversation_id,
            sender_id,
            recipient_id,
            group_id,
            content,
            message_type,
            status: MessageStatus::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
            is_encrypted: false,
        }
    }

    /// Once the server has assigned an id, server-confirmed fields win over
    /// local ones and may never regress.
    pub fn is_server_authoritative(&self) -> bool {
        self.server_id.is_some()
    }
}

/// What an idempotent upsert did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed; a new row was written.
    Inserted,
    /// An existing row (matched by client id or server id) was overwritten.
    Updated,
    /// The stored row carries a newer version; nothing was written.
    Stale,
}

/// Result of applying a server acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack was recorded. `previous == current` when only the server id
    /// was new.
    Applied {
        previous: MessageStatus,
        current: MessageStatus,
    },
    /// The status in the ack would move the message backwards or out of a
    /// terminal state; the server id (if new) was still recorded.
    Rejected {
        current: MessageStatus,
        attempted: MessageStatus,
    },
    /// No local message with that client id.
    Unknown,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Aggregate of messages between a fixed participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationType,
    pub participant_ids: Vec<UserId>,
    /// Server id of the newest confirmed message.
    pub last_message_id: Option<ServerMessageId>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_synced: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// An empty conversation whose participants are read back from its id.
    pub fn for_id(id: ConversationId) -> Self {
        let (kind, participant_ids) = match id.key() {
            Ok(ConversationKey::Direct(a, b)) => (ConversationType::Direct, vec![a, b]),
            Ok(ConversationKey::Group(_)) => (ConversationType::Group, Vec::new()),
            Err(_) => (id.kind(), Vec::new()),
        };

        Self {
            id,
            kind,
            participant_ids,
            last_message_id: None,
            last_message_at: None,
            unread_count: 0,
            is_synced: false,
            last_sync_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Per-scope sync checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    /// `last_sync` for the global checkpoint, `conversation:<id>` otherwise.
    pub key: String,
    pub conversation_id: Option<ConversationId>,
    pub last_message_id: Option<ServerMessageId>,
    pub last_sync_at: DateTime<Utc>,
    pub pending_count: u32,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub total_messages: u64,
    pub pending_messages: u64,
    pub conversations: u64,
}
