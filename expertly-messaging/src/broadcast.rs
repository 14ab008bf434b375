use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use expertly_shared::types::{
    Conversation, DeliveryReceipt, Message, ReadReceipt, ServerEvent, TypingState,
};

use crate::rooms::{RoomEnvelope, RoomHub, SessionId};

/// Turns store outcomes into realtime events and routes them.
///
/// Room events reach every session in the conversation room, the sender's
/// own sessions included, so all of a participant's devices converge on the
/// persisted state. Only `typing.state` skips the session that caused it.
#[derive(Clone)]
pub struct Broadcaster {
    hub: Arc<dyn RoomHub>,
}

impl Broadcaster {
    pub fn new(hub: Arc<dyn RoomHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<dyn RoomHub> {
        &self.hub
    }

    pub fn message_created(&self, message: &Message) {
        self.to_room(message.conversation_id, ServerEvent::MessageCreated(message.clone()), None);
    }

    pub fn conversation_updated(&self, conversation: &Conversation) {
        self.to_room(conversation.id, ServerEvent::ConversationUpdated(conversation.clone()), None);
    }

    pub fn typing(&self, origin: &SessionId, conversation_id: Uuid, user_id: &str, is_typing: bool) {
        let event = ServerEvent::TypingState(TypingState {
            conversation_id,
            user_id: user_id.to_string(),
            is_typing,
        });
        self.to_room(conversation_id, event, Some(origin.clone()));
    }

    pub fn messages_read(&self, conversation_id: Uuid, reader_id: &str, timestamp: DateTime<Utc>) {
        let event = ServerEvent::MessagesRead(ReadReceipt {
            conversation_id,
            reader_id: reader_id.to_string(),
            timestamp,
        });
        self.to_room(conversation_id, event, None);
    }

    pub fn messages_delivered(&self, conversation_id: Uuid, recipient_id: &str, timestamp: DateTime<Utc>) {
        let event = ServerEvent::MessagesDelivered(DeliveryReceipt {
            conversation_id,
            recipient_id: recipient_id.to_string(),
            timestamp,
        });
        self.to_room(conversation_id, event, None);
    }

    /// Sends an `error` event to a single session.
    pub fn error(&self, session: &SessionId, code: &str, message: &str, client_key: Option<String>) -> bool {
        metrics::counter!("chat_events_broadcast_total", "event" => "error").increment(1);
        self.hub
            .send_to(session, ServerEvent::error(code, message, client_key))
    }

    fn to_room(&self, conversation_id: Uuid, event: ServerEvent, except: Option<SessionId>) {
        let kind = event.kind();
        metrics::counter!("chat_events_broadcast_total", "event" => kind.as_str()).increment(1);
        tracing::debug!(conversation_id = %conversation_id, event = %kind, "broadcasting");
        self.hub.publish(RoomEnvelope {
            conversation_id,
            event,
            except,
        });
    }
}
