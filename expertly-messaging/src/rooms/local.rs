use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use expertly_shared::types::ServerEvent;

use super::{Outbox, RoomEnvelope, RoomHub, SessionId};

struct SessionEntry {
    participant_id: String,
    outbox: Outbox,
    rooms: HashSet<Uuid>,
    typing: HashSet<Uuid>,
}

/// In-process hub.
///
/// The two maps are never locked at the same time: each operation finishes
/// with one before touching the other.
#[derive(Default)]
pub struct LocalRoomHub {
    sessions: DashMap<SessionId, SessionEntry>,
    rooms: DashMap<Uuid, HashSet<SessionId>>,
}

impl LocalRoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the envelope to every matching session on this process and
    /// returns how many outboxes accepted it.
    pub fn deliver(&self, envelope: &RoomEnvelope) -> usize {
        let targets: Vec<SessionId> = match self.rooms.get(&envelope.conversation_id) {
            Some(members) => members
                .iter()
                .filter(|sid| envelope.except.as_ref() != Some(*sid))
                .cloned()
                .collect(),
            None => return 0,
        };

        targets
            .iter()
            .filter(|sid| self.send_to(sid, envelope.event.clone()))
            .count()
    }

    pub fn sessions_in(&self, conversation_id: Uuid) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self
            .rooms
            .get(&conversation_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        sessions.sort();
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Second half of `join`. A `disconnect` may have run since the session
    /// entry was released; the room must not keep a member that is gone.
    fn add_to_room(&self, session: &SessionId, conversation_id: Uuid) -> bool {
        self.rooms.entry(conversation_id).or_default().insert(session.clone());
        if self.sessions.contains_key(session) {
            return true;
        }
        self.remove_from_room(session, conversation_id);
        false
    }

    fn remove_from_room(&self, session: &SessionId, conversation_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(&conversation_id) {
            members.remove(session);
        }
        self.rooms.remove_if(&conversation_id, |_, members| members.is_empty());
    }
}

impl RoomHub for LocalRoomHub {
    fn register(&self, session: SessionId, participant_id: String, outbox: Outbox) {
        tracing::debug!(session = %session, participant_id = %participant_id, "session registered");
        self.sessions.insert(
            session,
            SessionEntry {
                participant_id,
                outbox,
                rooms: HashSet::new(),
                typing: HashSet::new(),
            },
        );
    }

    fn participant_of(&self, session: &SessionId) -> Option<String> {
        self.sessions.get(session).map(|entry| entry.participant_id.clone())
    }

    fn join(&self, session: &SessionId, conversation_id: Uuid) -> bool {
        match self.sessions.get_mut(session) {
            Some(mut entry) => {
                entry.rooms.insert(conversation_id);
            }
            None => return false,
        }
        self.add_to_room(session, conversation_id)
    }

    fn leave(&self, session: &SessionId, conversation_id: Uuid) {
        if let Some(mut entry) = self.sessions.get_mut(session) {
            entry.rooms.remove(&conversation_id);
            entry.typing.remove(&conversation_id);
        }
        self.remove_from_room(session, conversation_id);
    }

    fn is_member(&self, session: &SessionId, conversation_id: Uuid) -> bool {
        self.sessions
            .get(session)
            .map(|entry| entry.rooms.contains(&conversation_id))
            .unwrap_or(false)
    }

    fn set_typing(&self, session: &SessionId, conversation_id: Uuid, is_typing: bool) -> bool {
        match self.sessions.get_mut(session) {
            Some(mut entry) if is_typing => entry.typing.insert(conversation_id),
            Some(mut entry) => entry.typing.remove(&conversation_id),
            None => false,
        }
    }

    fn disconnect(&self, session: &SessionId) -> Option<(String, Vec<Uuid>)> {
        let (_, entry) = self.sessions.remove(session)?;
        for conversation_id in &entry.rooms {
            self.remove_from_room(session, *conversation_id);
        }
        tracing::debug!(session = %session, rooms = entry.rooms.len(), "session removed");

        let mut typing: Vec<Uuid> = entry.typing.into_iter().collect();
        typing.sort();
        Some((entry.participant_id, typing))
    }

    fn publish(&self, envelope: RoomEnvelope) {
        let delivered = self.deliver(&envelope);
        tracing::trace!(
            conversation_id = %envelope.conversation_id,
            event = %envelope.event.kind(),
            delivered,
            "room event delivered"
        );
    }

    fn send_to(&self, session: &SessionId, event: ServerEvent) -> bool {
        match self.sessions.get(session) {
            Some(entry) => entry.outbox.send(event).is_ok(),
            None => false,
        }
    }
}
