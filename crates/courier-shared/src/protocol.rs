//! JSON wire protocol spoken over the live connection.
//!
//! Every frame is an envelope `{"type": <kind>, "payload": {...}}`. The
//! client sends [`OutboundFrame`]s and receives [`InboundFrame`]s; field
//! names on the wire are snake_case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::types::{
    ClientId, ConversationId, GroupId, MessageStatus, MessageType, ServerMessageId, UserId,
};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Frames originated by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// A new chat message
    Chat(ChatPayload),
    /// Per-conversation checkpoints so the server can push the delta
    Sync(SyncPayload),
    /// Liveness probe
    Ping(PingPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub conversations: Vec<SyncCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub conversation_id: ConversationId,
    pub last_message_id: Option<ServerMessageId>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Unix milliseconds at which the probe was sent.
    pub timestamp: i64,
}

impl OutboundFrame {
    pub fn ping_now() -> Self {
        Self::Ping(PingPayload {
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Sync(_) => "sync",
            Self::Ping(_) => "ping",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Server accepted (or rejected) a client-originated message
    Ack(AckPayload),
    /// A message pushed in real time
    Message(ServerMessage),
    /// Delta for one conversation in answer to a `sync` frame
    SyncResponse(SyncResponsePayload),
    /// Transient typing indicator
    Typing(TypingPayload),
    /// Application-level error report
    Error(ErrorPayload),
    /// Answer to a `ping`
    Pong(PongPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub client_id: ClientId,
    pub server_id: ServerMessageId,
    #[serde(default = "default_ack_status")]
    pub status: MessageStatus,
}

fn default_ack_status() -> MessageStatus {
    MessageStatus::Sent
}

/// Server-canonical message object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub id: Option<ServerMessageId>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default = "Utc::now", with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

fn default_version() -> i64 {
    1
}

impl ServerMessage {
    /// The conversation this message belongs to, as seen by `local_user`.
    ///
    /// Uses the explicit `conversation_id` when present, otherwise derives it
    /// from the group id or the direct participant pair.
    pub fn resolve_conversation(&self, local_user: UserId) -> ConversationId {
        if let Some(ref id) = self.conversation_id {
            return id.clone();
        }
        if let Some(group_id) = self.group_id {
            return ConversationId::group(group_id);
        }
        let other = self.recipient_id.unwrap_or(local_user);
        ConversationId::direct(self.sender_id, other)
    }

    /// The key the Ledger stores this message under.
    pub fn resolve_client_id(&self) -> Option<ClientId> {
        self.client_id
            .clone()
            .or_else(|| self.id.map(ClientId::for_server_message))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub messages: Vec<ServerMessage>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub user_id: UserId,
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Server error code; some servers send numbers, others strings.
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PongPayload {
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Envelope as it appears on the wire, before the payload is interpreted.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack(_) => "ack",
            Self::Message(_) => "message",
            Self::SyncResponse(_) => "sync_response",
            Self::Typing(_) => "typing",
            Self::Error(_) => "error",
            Self::Pong(_) => "pong",
        }
    }

    /// Parse one inbound frame. A missing or `null` payload is read as `{}`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let raw: RawEnvelope = serde_json::from_str(text)?;
        let payload = match raw.payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        let frame = match raw.kind.as_str() {
            "ack" => Self::Ack(serde_json::from_value(payload)?),
            "message" => Self::Message(serde_json::from_value(payload)?),
            "sync_response" => Self::SyncResponse(serde_json::from_value(payload)?),
            "typing" => Self::Typing(serde_json::from_value(payload)?),
            "error" => Self::Error(serde_json::from_value(payload)?),
            "pong" => Self::Pong(serde_json::from_value(payload)?),
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Accepts either RFC 3339 text or Unix milliseconds; always writes RFC 3339.
mod flexible_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {ms}"))),
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(D::Error::custom),
        }
    }
}
