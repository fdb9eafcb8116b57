use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{CONVERSATION_SYNC_PREFIX, SYNTHETIC_CLIENT_ID_PREFIX};
use crate::error::ProtocolError;

/// Id the server assigns to a message once it accepts it.
pub type ServerMessageId = i64;

// User identity as issued by the session collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated message key. Stable before the server acknowledges the
/// message and never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic key for an inbound message that arrived without a
    /// client id, so redelivery of the same server message stays idempotent.
    pub fn for_server_message(server_id: ServerMessageId) -> Self {
        Self(format!("{SYNTHETIC_CLIENT_ID_PREFIX}{server_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Conversation id
// ---------------------------------------------------------------------------

/// Conversation key derived purely from its participants.
///
/// Direct conversations are `user_<low>_<high>` with the two user ids in
/// ascending order, so both sides resolve to the same id. Group
/// conversations are `group_<group id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

/// Participants encoded in a [`ConversationId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKey {
    Direct(UserId, UserId),
    Group(GroupId),
}

impl ConversationId {
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("user_{}_{}", low.0, high.0))
    }

    pub fn group(group_id: GroupId) -> Self {
        Self(format!("group_{}", group_id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ConversationType {
        if self.0.starts_with("group_") {
            ConversationType::Group
        } else {
            ConversationType::Direct
        }
    }

    /// Decode the participants back out of the id.
    pub fn key(&self) -> Result<ConversationKey, ProtocolError> {
        let invalid = || ProtocolError::InvalidConversationId(self.0.clone());

        if let Some(rest) = self.0.strip_prefix("user_") {
            let (a, b) = rest.split_once('_').ok_or_else(invalid)?;
            let a: i64 = a.parse().map_err(|_| invalid())?;
            let b: i64 = b.parse().map_err(|_| invalid())?;
            return Ok(ConversationKey::Direct(UserId(a), UserId(b)));
        }

        if let Some(rest) = self.0.strip_prefix("group_") {
            let g: i64 = rest.parse().map_err(|_| invalid())?;
            return Ok(ConversationKey::Group(GroupId(g)));
        }

        Err(invalid())
    }

    /// Key of this conversation's row in the sync-state table.
    pub fn sync_key(&self) -> String {
        format!("{CONVERSATION_SYNC_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        id.key()?;
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(ProtocolError::UnknownConversationType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Delivery status of a message.
///
/// Valid moves follow `pending -> sent -> delivered -> read` (skipping ahead
/// is allowed, going back is not) plus `pending -> failed`. `failed` is
/// terminal and `read` is final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    /// Staying on the same status is not a transition.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(target)) => target > current,
            (Some(0), None) => true,
            _ => false,
        }
    }

    /// The status that results from observing `incoming`: the incoming one
    /// when it is a valid forward move, otherwise the current one.
    pub fn merge(self, incoming: MessageStatus) -> MessageStatus {
        if self.can_transition_to(incoming) {
            incoming
        } else {
            self
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle state of the live connection as seen by the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_conversation_id_is_symmetric() {
        for (a, b) in [(3, 7), (7, 3), (1, 1), (-5, 12), (i64::MAX, 0)] {
            assert_eq!(
                ConversationId::direct(UserId(a), UserId(b)),
                ConversationId::direct(UserId(b), UserId(a)),
            );
        }
        assert_eq!(ConversationId::direct(UserId(7), UserId(3)).as_str(), "user_3_7");
    }

    #[test]
    fn conversation_id_round_trips_participants() {
        let id: ConversationId = "user_3_7".parse().unwrap();
        assert_eq!(id.key().unwrap(), ConversationKey::Direct(UserId(3), UserId(7)));
        assert_eq!(id.kind(), ConversationType::Direct);

        let group = ConversationId::group(GroupId(9));
        assert_eq!(group.as_str(), "group_9");
        assert_eq!(group.key().unwrap(), ConversationKey::Group(GroupId(9)));
        assert_eq!(group.kind(), ConversationType::Group);

        assert!("chat_1".parse::<ConversationId>().is_err());
        assert!("user_1".parse::<ConversationId>().is_err());
        assert!("group_x".parse::<ConversationId>().is_err());
    }

    #[test]
    fn status_moves_forward_only() {
        use MessageStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Pending.can_transition_to(Delivered));

        assert!(!Read.can_transition_to(Pending));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Sent.can_transition_to(Sent));
    }

    #[test]
    fn merge_never_regresses() {
        use MessageStatus::*;

        assert_eq!(Read.merge(Delivered), Read);
        assert_eq!(Sent.merge(Delivered), Delivered);
        assert_eq!(Failed.merge(Delivered), Failed);
        assert_eq!(Pending.merge(Failed), Failed);
    }

    #[test]
    fn status_string_forms() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("seen".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn synthetic_client_id_is_deterministic() {
        assert_eq!(ClientId::for_server_message(42), ClientId::for_server_message(42));
        assert_eq!(ClientId::for_server_message(42).as_str(), "srv-42");
        assert_ne!(ClientId::generate(), ClientId::generate());
    }
}
