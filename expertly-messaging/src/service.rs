use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use expertly_shared::errors::{AppError, AppResult, ErrorCode};
use expertly_shared::types::{
    AttachmentMetadata, Conversation, Message, MessagePayload, Paginated, PaginationParams,
    SendMessageCommand,
};

use crate::attachments::{AttachmentPipeline, AttachmentUpload};
use crate::broadcast::Broadcaster;
use crate::events::DomainEvents;
use crate::rooms::{Outbox, RoomHub, SessionId};
use crate::store::{ChatStore, NewMessage, ReadOutcome};

/// Conversation operations shared by the HTTP routes and the realtime
/// handlers. Persists first, then broadcasts from the persisted result.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    broadcaster: Broadcaster,
    events: Arc<dyn DomainEvents>,
    attachments: Arc<dyn AttachmentPipeline>,
}

fn ensure_member(conversation: &Conversation, participant_id: &str) -> AppResult<()> {
    if conversation.has_participant(participant_id) {
        Ok(())
    } else {
        Err(AppError::new(
            ErrorCode::NotConversationMember,
            "not a participant of this conversation",
        ))
    }
}

impl ChatService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        hub: Arc<dyn RoomHub>,
        events: Arc<dyn DomainEvents>,
        attachments: Arc<dyn AttachmentPipeline>,
    ) -> Self {
        Self {
            store,
            broadcaster: Broadcaster::new(hub),
            events,
            attachments,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    fn hub(&self) -> &Arc<dyn RoomHub> {
        self.broadcaster.hub()
    }

    // ─── Conversations ──────────────────────────────────────────────────

    pub async fn create_conversation(&self, a: &str, b: &str) -> AppResult<Conversation> {
        Ok(self.store.find_or_create_conversation(a, b).await?)
    }

    /// Loads a conversation the participant belongs to.
    pub async fn conversation_for(&self, conversation_id: Uuid, participant_id: &str) -> AppResult<Conversation> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        ensure_member(&conversation, participant_id)?;
        Ok(conversation)
    }

    pub async fn list_conversations(&self, participant_id: &str) -> AppResult<Vec<Conversation>> {
        Ok(self.store.list_conversations(participant_id).await?)
    }

    pub async fn unread_total(&self, participant_id: &str) -> AppResult<u64> {
        Ok(self.store.unread_total(participant_id).await?)
    }

    // ─── Messages ───────────────────────────────────────────────────────

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        participant_id: &str,
        params: &PaginationParams,
    ) -> AppResult<Paginated<Message>> {
        self.conversation_for(conversation_id, participant_id).await?;
        let offset = i64::try_from(params.offset()).unwrap_or(i64::MAX);
        let (items, total) = self
            .store
            .list_messages_page(conversation_id, offset, params.limit() as i64)
            .await?;
        Ok(Paginated::new(items, total.max(0) as u64, params))
    }

    /// Validates, persists and broadcasts a message. A repeated `client_key`
    /// returns the original message and re-broadcasts only `message.created`.
    pub async fn send_message(&self, sender_id: &str, command: SendMessageCommand) -> AppResult<Message> {
        let payload = MessagePayload::try_from(command.payload)
            .map_err(|e| AppError::new(ErrorCode::ValidationError, e))?;

        let conversation = self.conversation_for(command.conversation_id, sender_id).await?;
        let other = conversation.other_participant(sender_id).unwrap_or_default().to_string();
        let receiver_id = match command.receiver_id {
            Some(receiver) if receiver == other => receiver,
            Some(_) => {
                return Err(AppError::new(
                    ErrorCode::ValidationError,
                    "receiver_id must be the other participant",
                ))
            }
            None => other,
        };

        let created = self
            .store
            .create_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: sender_id.to_string(),
                receiver_id,
                payload,
                client_key: command.client_key,
            })
            .await?;

        self.broadcaster.message_created(&created.message);
        if created.inserted {
            self.broadcaster.conversation_updated(&created.conversation);
            metrics::counter!(
                "chat_messages_created_total",
                "kind" => created.message.payload.kind().as_str()
            )
            .increment(1);
            tracing::info!(
                message_id = %created.message.id,
                conversation_id = %conversation.id,
                kind = %created.message.payload.kind(),
                "message created"
            );
            self.events.message_sent(&created.message).await;
        } else {
            tracing::debug!(message_id = %created.message.id, "duplicate client_key, returning existing message");
        }

        Ok(created.message)
    }

    /// Marks everything addressed to `reader_id` as read. `messages.read` is
    /// broadcast on every call; the summary only when something changed.
    pub async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> AppResult<ReadOutcome> {
        self.conversation_for(conversation_id, reader_id).await?;
        let outcome = self.store.mark_read(conversation_id, reader_id).await?;

        self.broadcaster.messages_read(conversation_id, reader_id, Utc::now());
        if outcome.count > 0 {
            self.broadcaster.conversation_updated(&outcome.conversation);
            metrics::counter!("chat_messages_read_total").increment(outcome.count);
            tracing::debug!(conversation_id = %conversation_id, count = outcome.count, "messages read");
            self.events.messages_read(conversation_id, reader_id, outcome.count).await;
        }
        Ok(outcome)
    }

    pub async fn upload_attachment(&self, uploader_id: &str, upload: AttachmentUpload) -> AppResult<AttachmentMetadata> {
        Ok(self.attachments.upload(uploader_id, upload).await?)
    }

    // ─── Realtime sessions ──────────────────────────────────────────────

    pub fn connect(&self, session: SessionId, participant_id: String, outbox: Outbox) {
        self.hub().register(session, participant_id, outbox);
    }

    fn session_participant(&self, session: &SessionId) -> AppResult<String> {
        self.hub()
            .participant_of(session)
            .ok_or_else(|| AppError::unauthorized("session is not authenticated"))
    }

    /// Subscribes the session to the conversation room. Pending messages for
    /// the participant count as delivered from here on.
    pub async fn join(&self, session: &SessionId, conversation_id: Uuid) -> AppResult<()> {
        let participant_id = self.session_participant(session)?;
        self.conversation_for(conversation_id, &participant_id).await?;
        self.hub().join(session, conversation_id);
        tracing::debug!(session = %session, conversation_id = %conversation_id, "joined room");

        let delivered = self.store.mark_delivered(conversation_id, &participant_id).await?;
        if delivered > 0 {
            self.broadcaster.messages_delivered(conversation_id, &participant_id, Utc::now());
        }
        Ok(())
    }

    pub fn leave(&self, session: &SessionId, conversation_id: Uuid) {
        if let Some(participant_id) = self.hub().participant_of(session) {
            if self.hub().set_typing(session, conversation_id, false) {
                self.broadcaster.typing(session, conversation_id, &participant_id, false);
            }
        }
        self.hub().leave(session, conversation_id);
    }

    /// Relays a typing flag to the rest of the room. Only sessions that
    /// joined the room may send one.
    pub fn typing(&self, session: &SessionId, conversation_id: Uuid, is_typing: bool) -> AppResult<()> {
        let participant_id = self.session_participant(session)?;
        if !self.hub().is_member(session, conversation_id) {
            return Err(AppError::new(
                ErrorCode::NotConversationMember,
                "join the conversation before sending typing state",
            ));
        }
        self.hub().set_typing(session, conversation_id, is_typing);
        self.broadcaster.typing(session, conversation_id, &participant_id, is_typing);
        Ok(())
    }

    /// Drops the session; rooms where it was typing see a stop.
    pub fn disconnect(&self, session: &SessionId) {
        if let Some((participant_id, typing)) = self.hub().disconnect(session) {
            for conversation_id in typing {
                self.broadcaster.typing(session, conversation_id, &participant_id, false);
            }
        }
    }

    /// Reports a failed command back to the session that issued it.
    pub fn report_error(&self, session: &SessionId, err: &AppError, client_key: Option<String>) {
        let (code, message) = err.code_and_message();
        if !self.broadcaster.error(session, code, &message, client_key) {
            tracing::debug!(session = %session, code, "error event dropped, session gone");
        }
    }
}
