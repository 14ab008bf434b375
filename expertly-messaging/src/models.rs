use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use expertly_shared::types::{Conversation, Message, MessageKind, MessagePayload, MessageStatus};

use crate::schema::{conversations, messages};

// --- Conversation ---

#[derive(Debug, Queryable, Selectable, Identifiable, Clone)]
#[diesel(table_name = conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConversationRow {
    pub id: Uuid,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<Uuid>,
    pub last_message_text: String,
    pub unread_a: i32,
    pub unread_b: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        let mut unread_count = BTreeMap::new();
        unread_count.insert(row.participant_a.clone(), row.unread_a.max(0) as u32);
        unread_count.insert(row.participant_b.clone(), row.unread_b.max(0) as u32);
        Conversation {
            id: row.id,
            participant_a: row.participant_a,
            participant_b: row.participant_b,
            last_message_id: row.last_message_id,
            last_message_text: row.last_message_text,
            unread_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Participants must already be in canonical order.
#[derive(Debug, Insertable)]
#[diesel(table_name = conversations)]
pub struct NewConversationRow<'a> {
    pub id: Uuid,
    pub participant_a: &'a str,
    pub participant_b: &'a str,
}

// --- Message ---

/// One row per message. The payload variant is spread over nullable columns
/// and rebuilt on read.
#[derive(Debug, Queryable, Selectable, Insertable, Identifiable, Clone)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub kind: String,
    pub body: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub duration_secs: Option<i32>,
    pub thumbnail_url: Option<String>,
    pub client_key: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    /// Fails when a size or duration does not fit its column.
    pub fn from_message(message: &Message) -> Result<Self, String> {
        let file_size = |size: u64| {
            i64::try_from(size).map_err(|_| format!("file_size {size} is out of range"))
        };

        let mut row = MessageRow {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            kind: message.payload.kind().as_str().to_string(),
            body: None,
            file_url: None,
            file_name: None,
            file_size: None,
            mime_type: None,
            duration_secs: None,
            thumbnail_url: None,
            client_key: message.client_key.clone(),
            status: message.status.as_str().to_string(),
            created_at: message.timestamp,
            read_at: message.read_at,
        };

        match &message.payload {
            MessagePayload::Text { text } => row.body = Some(text.clone()),
            MessagePayload::Image { file_url, file_name, file_size: size, mime_type, thumbnail_url } => {
                row.file_url = Some(file_url.clone());
                row.file_name = Some(file_name.clone());
                row.file_size = Some(file_size(*size)?);
                row.mime_type = Some(mime_type.clone());
                row.thumbnail_url = thumbnail_url.clone();
            }
            MessagePayload::Document { file_url, file_name, file_size: size, mime_type } => {
                row.file_url = Some(file_url.clone());
                row.file_name = Some(file_name.clone());
                row.file_size = Some(file_size(*size)?);
                row.mime_type = Some(mime_type.clone());
            }
            MessagePayload::Voice { file_url, duration_secs, mime_type, file_size: size, thumbnail_url } => {
                row.file_url = Some(file_url.clone());
                row.duration_secs = Some(
                    i32::try_from(*duration_secs)
                        .map_err(|_| format!("duration_secs {duration_secs} is out of range"))?,
                );
                row.mime_type = mime_type.clone();
                row.file_size = size.map(file_size).transpose()?;
                row.thumbnail_url = thumbnail_url.clone();
            }
        }

        Ok(row)
    }

    fn payload(&self) -> Result<MessagePayload, String> {
        let kind: MessageKind = self.kind.parse()?;
        let missing = |field: &str| format!("message {} ({kind}) has no {field}", self.id);
        let file_size = self.file_size.map(|s| s.max(0) as u64);

        Ok(match kind {
            MessageKind::Text => MessagePayload::Text {
                text: self.body.clone().ok_or_else(|| missing("body"))?,
            },
            MessageKind::Image => MessagePayload::Image {
                file_url: self.file_url.clone().ok_or_else(|| missing("file_url"))?,
                file_name: self.file_name.clone().unwrap_or_default(),
                file_size: file_size.unwrap_or(0),
                mime_type: self.mime_type.clone().unwrap_or_default(),
                thumbnail_url: self.thumbnail_url.clone(),
            },
            MessageKind::Document => MessagePayload::Document {
                file_url: self.file_url.clone().ok_or_else(|| missing("file_url"))?,
                file_name: self.file_name.clone().unwrap_or_default(),
                file_size: file_size.unwrap_or(0),
                mime_type: self.mime_type.clone().unwrap_or_default(),
            },
            MessageKind::Voice => MessagePayload::Voice {
                file_url: self.file_url.clone().ok_or_else(|| missing("file_url"))?,
                duration_secs: self.duration_secs.unwrap_or(0).max(0) as u32,
                mime_type: self.mime_type.clone(),
                file_size,
                thumbnail_url: self.thumbnail_url.clone(),
            },
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = String;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let payload = row.payload()?;
        let status: MessageStatus = row.status.parse()?;
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            payload,
            status,
            timestamp: row.created_at,
            read_at: row.read_at,
            client_key: row.client_key,
        })
    }
}
