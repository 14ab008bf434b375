// Realtime channel protocol shared by the messaging service and its clients.
//
// Server events are room-scoped (a room is a conversation id) except `error`,
// which only ever goes back to the session that caused it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chat::{Conversation, Message, PayloadInput};

// ─── Event names ────────────────────────────────────────────────────────────

/// Event names emitted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.created")]
    MessageCreated,
    #[serde(rename = "conversation.updated")]
    ConversationUpdated,
    #[serde(rename = "typing.state")]
    TypingState,
    #[serde(rename = "messages.read")]
    MessagesRead,
    #[serde(rename = "messages.delivered")]
    MessagesDelivered,
    #[serde(rename = "error")]
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageCreated => "message.created",
            Self::ConversationUpdated => "conversation.updated",
            Self::TypingState => "typing.state",
            Self::MessagesRead => "messages.read",
            Self::MessagesDelivered => "messages.delivered",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event names emitted by clients.
pub mod commands {
    pub const JOIN: &str = "conversation.join";
    pub const LEAVE: &str = "conversation.leave";
    pub const SEND: &str = "message.send";
    pub const TYPING: &str = "typing";
    pub const MARK_READ: &str = "messages.mark_read";
}

// ─── Payloads ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingState {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub reader_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub conversation_id: Uuid,
    pub recipient_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

// ─── Envelope ───────────────────────────────────────────────────────────────

/// Every event the server can push over the realtime channel.
///
/// ```json
/// { "event": "typing.state",
///   "data": { "conversation_id": "...", "user_id": "u1", "is_typing": true } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message.created")]
    MessageCreated(Message),
    #[serde(rename = "conversation.updated")]
    ConversationUpdated(Conversation),
    #[serde(rename = "typing.state")]
    TypingState(TypingState),
    #[serde(rename = "messages.read")]
    MessagesRead(ReadReceipt),
    #[serde(rename = "messages.delivered")]
    MessagesDelivered(DeliveryReceipt),
    #[serde(rename = "error")]
    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageCreated(_) => EventKind::MessageCreated,
            Self::ConversationUpdated(_) => EventKind::ConversationUpdated,
            Self::TypingState(_) => EventKind::TypingState,
            Self::MessagesRead(_) => EventKind::MessagesRead,
            Self::MessagesDelivered(_) => EventKind::MessagesDelivered,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Room the event belongs to; `None` for session-scoped errors.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreated(m) => Some(m.conversation_id),
            Self::ConversationUpdated(c) => Some(c.id),
            Self::TypingState(t) => Some(t.conversation_id),
            Self::MessagesRead(r) => Some(r.conversation_id),
            Self::MessagesDelivered(d) => Some(d.conversation_id),
            Self::Error(_) => None,
        }
    }

    /// The `data` part alone, for transports that carry the event name
    /// separately.
    pub fn data(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::MessageCreated(m) => serde_json::to_value(m),
            Self::ConversationUpdated(c) => serde_json::to_value(c),
            Self::TypingState(t) => serde_json::to_value(t),
            Self::MessagesRead(r) => serde_json::to_value(r),
            Self::MessagesDelivered(d) => serde_json::to_value(d),
            Self::Error(e) => serde_json::to_value(e),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, client_key: Option<String>) -> Self {
        Self::Error(ErrorEvent {
            code: code.into(),
            message: message.into(),
            client_key,
        })
    }
}

// ─── Client commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCommand {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageCommand {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub receiver_id: Option<String>,
    pub payload: PayloadInput,
    #[serde(default)]
    pub client_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingCommand {
    pub conversation_id: Uuid,
    pub is_typing: bool,
}
