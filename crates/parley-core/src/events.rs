use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::ids::{ConversationId, UserId};

/// Discriminator carried in the `type` field of every wire frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JoinConversation,
    JoinSuccess,
    NewMessage,
    NewConversation,
    UserOnline,
    UserOffline,
    /// Any `type` this server does not understand, or a missing one.
    #[default]
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinConversation => "join_conversation",
            Self::JoinSuccess => "join_success",
            Self::NewMessage => "new_message",
            Self::NewConversation => "new_conversation",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, Self::UserOnline | Self::UserOffline)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON object exchanged with clients in both directions:
/// `{ type, conversation_id, sender_id, message, created_at }`.
///
/// Every field is optional on the wire; absent fields decode to empty
/// strings and `0`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub message: String,
    /// Unix seconds.
    pub created_at: i64,
}

impl WireEvent {
    /// Presence notification about `user`, stamped now.
    pub fn presence(kind: EventKind, user: &UserId) -> Self {
        Self {
            kind,
            sender_id: user.clone(),
            created_at: now_unix(),
            ..Default::default()
        }
    }

    pub fn user_online(user: &UserId) -> Self {
        Self::presence(EventKind::UserOnline, user)
    }

    pub fn user_offline(user: &UserId) -> Self {
        Self::presence(EventKind::UserOffline, user)
    }

    /// Confirmation sent back to a client after it joined a conversation.
    pub fn join_success(conversation_id: &ConversationId, user: &UserId) -> Self {
        Self {
            kind: EventKind::JoinSuccess,
            conversation_id: conversation_id.clone(),
            sender_id: user.clone(),
            created_at: now_unix(),
            ..Default::default()
        }
    }

    pub fn new_message(
        conversation_id: &ConversationId,
        sender: &UserId,
        message: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            kind: EventKind::NewMessage,
            conversation_id: conversation_id.clone(),
            sender_id: sender.clone(),
            message: message.into(),
            created_at,
        }
    }

    /// Parse one inbound text frame.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(raw).map_err(FrameError::from)
    }

    /// Serialize into the byte payload queued for a session.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(FrameError::from)
    }
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
