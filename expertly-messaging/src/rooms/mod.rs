//! Live sessions and the conversation rooms they have joined.
//!
//! A room is keyed by conversation id. Delivery into a room is fire-and-forget:
//! each session owns an unbounded outbox drained by its transport task, so a
//! slow or dead session never blocks a publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use expertly_shared::types::ServerEvent;

pub mod local;
pub mod redis;

pub use local::LocalRoomHub;
pub use self::redis::RedisRoomHub;

/// Transport-level identity of one connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// An event addressed to everyone in a room, optionally minus one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEnvelope {
    pub conversation_id: Uuid,
    pub event: ServerEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<SessionId>,
}

pub trait RoomHub: Send + Sync {
    /// Tracks a newly authenticated session.
    fn register(&self, session: SessionId, participant_id: String, outbox: Outbox);

    fn participant_of(&self, session: &SessionId) -> Option<String>;

    /// Returns `false` if the session is unknown.
    fn join(&self, session: &SessionId, conversation_id: Uuid) -> bool;

    /// Leaving also clears the session's typing flag for that room.
    fn leave(&self, session: &SessionId, conversation_id: Uuid);

    fn is_member(&self, session: &SessionId, conversation_id: Uuid) -> bool;

    /// Records the session's typing flag. Returns `false` when nothing changed.
    fn set_typing(&self, session: &SessionId, conversation_id: Uuid, is_typing: bool) -> bool;

    /// Removes the session from every room. Returns the rooms in which it was
    /// still flagged as typing, along with its participant id.
    fn disconnect(&self, session: &SessionId) -> Option<(String, Vec<Uuid>)>;

    /// Fans an event out to the room.
    fn publish(&self, envelope: RoomEnvelope);

    /// Delivers an event to one local session.
    fn send_to(&self, session: &SessionId, event: ServerEvent) -> bool;
}
