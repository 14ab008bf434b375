//! Persistence for conversations and their messages.
//!
//! Every mutation that touches both a message and its conversation summary
//! (`create_message`, `mark_read`) commits as one unit: readers never see a
//! message without the matching `last_message_*`/unread change, or the
//! reverse.

use async_trait::async_trait;
use uuid::Uuid;

use expertly_shared::errors::{AppError, ErrorCode};
use expertly_shared::types::{Conversation, Message, MessagePayload};

pub mod memory;
pub mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => StoreError::NotFound("record"),
            other => StoreError::Persistence(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => AppError::new(ErrorCode::ValidationError, msg),
            StoreError::NotFound("conversation") => {
                AppError::new(ErrorCode::ConversationNotFound, "conversation not found")
            }
            StoreError::NotFound(what) => AppError::not_found(format!("{what} not found")),
            StoreError::Persistence(cause) => {
                tracing::error!(error = %cause, "store operation failed");
                AppError::new(ErrorCode::PersistenceFailed, "failed to persist changes")
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A message about to be persisted. Id, status and timestamp are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub payload: MessagePayload,
    pub client_key: Option<String>,
}

impl NewMessage {
    fn validate(&self) -> StoreResult<()> {
        if self.sender_id.trim().is_empty() {
            return Err(StoreError::Validation("sender_id is required".into()));
        }
        if self.receiver_id.trim().is_empty() {
            return Err(StoreError::Validation("receiver_id is required".into()));
        }
        if self.sender_id == self.receiver_id {
            return Err(StoreError::Validation("sender and receiver must differ".into()));
        }
        if matches!(&self.client_key, Some(key) if key.trim().is_empty()) {
            return Err(StoreError::Validation("client_key must not be blank".into()));
        }
        self.payload.validate().map_err(StoreError::Validation)
    }

    /// Both ends must be the conversation's two participants.
    fn check_participants(&self, conversation: &Conversation) -> StoreResult<()> {
        if conversation.other_participant(&self.sender_id) != Some(self.receiver_id.as_str()) {
            return Err(StoreError::Validation(
                "sender and receiver must be the conversation's participants".into(),
            ));
        }
        Ok(())
    }
}

/// Result of `create_message`.
#[derive(Debug, Clone)]
pub struct CreatedMessage {
    pub message: Message,
    pub conversation: Conversation,
    /// `false` when `client_key` matched an earlier message, which is
    /// returned unchanged instead of inserting a new one.
    pub inserted: bool,
}

/// Result of `mark_read`.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// Messages that changed to `read` in this call.
    pub count: u64,
    pub conversation: Conversation,
}

fn validate_pair(a: &str, b: &str) -> StoreResult<()> {
    if a.trim().is_empty() || b.trim().is_empty() {
        return Err(StoreError::Validation("both participant ids are required".into()));
    }
    if a == b {
        return Err(StoreError::Validation("a conversation needs two distinct participants".into()));
    }
    Ok(())
}

fn require_participant(conversation: &Conversation, participant_id: &str) -> StoreResult<()> {
    if conversation.has_participant(participant_id) {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "{participant_id} is not a participant of conversation {}",
            conversation.id
        )))
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Returns the conversation for the unordered pair, creating it on first
    /// use. Concurrent calls for the same pair yield the same conversation.
    async fn find_or_create_conversation(&self, a: &str, b: &str) -> StoreResult<Conversation>;

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation>;

    /// Conversations the participant belongs to, most recently active first.
    async fn list_conversations(&self, participant_id: &str) -> StoreResult<Vec<Conversation>>;

    /// Sum of the participant's unread counters across all conversations.
    async fn unread_total(&self, participant_id: &str) -> StoreResult<u64>;

    /// Persists a message with status `sent`, then updates the conversation
    /// summary and the receiver's unread counter in the same unit of work.
    async fn create_message(&self, new: NewMessage) -> StoreResult<CreatedMessage>;

    /// All messages of a conversation, ascending by timestamp.
    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;

    /// A window of `list_messages` plus the total count.
    async fn list_messages_page(
        &self,
        conversation_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)>;

    /// Marks every message addressed to `reader_id` as read and recomputes the
    /// reader's unread counter. Does not touch `updated_at`.
    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<ReadOutcome>;

    /// Moves messages addressed to `recipient_id` from `sent` to `delivered`.
    async fn mark_delivered(&self, conversation_id: Uuid, recipient_id: &str) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(sender: &str, receiver: &str) -> NewMessage {
        NewMessage {
            conversation_id: Uuid::now_v7(),
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            payload: MessagePayload::text("hi"),
            client_key: None,
        }
    }

    #[test]
    fn draft_requires_both_ends() {
        assert!(matches!(draft("", "e1").validate(), Err(StoreError::Validation(_))));
        assert!(matches!(draft("c1", " ").validate(), Err(StoreError::Validation(_))));
        assert!(matches!(draft("c1", "c1").validate(), Err(StoreError::Validation(_))));
        assert!(draft("c1", "e1").validate().is_ok());
    }

    #[test]
    fn store_errors_map_to_api_codes() {
        let (code, _) = AppError::from(StoreError::NotFound("conversation")).code_and_message();
        assert_eq!(code, "E4001");

        let (code, message) = AppError::from(StoreError::Persistence("deadlock".into())).code_and_message();
        assert_eq!(code, "E4006");
        assert!(!message.contains("deadlock"));

        let (code, _) = AppError::from(StoreError::Validation("bad".into())).code_and_message();
        assert_eq!(code, "E0002");
    }
}
