use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest `last_message_text` kept on a conversation summary, in chars.
pub const PREVIEW_MAX_CHARS: usize = 100;

// --- Status ---

/// Delivery status of a message. Ordered: a status may only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Status after an attempted transition to `to`. Never moves backwards.
    pub fn advance(self, to: MessageStatus) -> MessageStatus {
        self.max(to)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            _ => Err(format!("unknown message status: {s}")),
        }
    }
}

// --- Kind ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Voice => "voice",
        }
    }

    pub fn is_attachment(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "voice" => Ok(Self::Voice),
            _ => Err(format!("unknown message type: {s}")),
        }
    }
}

// --- Payload ---

/// Message body. The `type` tag selects the variant and each variant carries
/// exactly the fields it requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    Image {
        file_url: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
    },
    Document {
        file_url: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
    },
    Voice {
        file_url: String,
        duration_secs: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
    },
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Document { .. } => MessageKind::Document,
            Self::Voice { .. } => MessageKind::Voice,
        }
    }

    pub fn text_body(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn file_url(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Image { file_url, .. }
            | Self::Document { file_url, .. }
            | Self::Voice { file_url, .. } => Some(file_url),
        }
    }

    /// Rejects payloads whose required content is blank.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Text { text } if text.trim().is_empty() => {
                Err("text message must have a non-empty body".into())
            }
            Self::Text { .. } => Ok(()),
            _ => match self.file_url() {
                Some(url) if !url.trim().is_empty() => Ok(()),
                _ => Err(format!("{} message requires file_url", self.kind())),
            },
        }
    }

    /// Summary line used for conversation lists.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } => text.chars().take(PREVIEW_MAX_CHARS).collect(),
            other => format!("[{}]", other.kind()),
        }
    }
}

/// Flat, loosely-typed payload as received from clients. Converted into a
/// [`MessagePayload`] with per-variant field checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadInput {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub duration_secs: Option<u32>,
    pub thumbnail_url: Option<String>,
}

fn required<T>(value: Option<T>, kind: MessageKind, field: &str) -> Result<T, String> {
    value.ok_or_else(|| format!("{kind} message requires {field}"))
}

impl TryFrom<PayloadInput> for MessagePayload {
    type Error = String;

    fn try_from(input: PayloadInput) -> Result<Self, Self::Error> {
        let kind: MessageKind = match input.kind.as_deref() {
            Some(k) => k.parse()?,
            None => MessageKind::Text,
        };

        let payload = match kind {
            MessageKind::Text => MessagePayload::Text {
                text: required(input.text, kind, "text")?,
            },
            MessageKind::Image => MessagePayload::Image {
                file_url: required(input.file_url, kind, "file_url")?,
                file_name: required(input.file_name, kind, "file_name")?,
                file_size: required(input.file_size, kind, "file_size")?,
                mime_type: required(input.mime_type, kind, "mime_type")?,
                thumbnail_url: input.thumbnail_url,
            },
            MessageKind::Document => MessagePayload::Document {
                file_url: required(input.file_url, kind, "file_url")?,
                file_name: required(input.file_name, kind, "file_name")?,
                file_size: required(input.file_size, kind, "file_size")?,
                mime_type: required(input.mime_type, kind, "mime_type")?,
            },
            MessageKind::Voice => MessagePayload::Voice {
                file_url: required(input.file_url, kind, "file_url")?,
                duration_secs: required(input.duration_secs, kind, "duration_secs")?,
                mime_type: input.mime_type,
                file_size: input.file_size,
                thumbnail_url: input.thumbnail_url,
            },
        };

        payload.validate()?;
        Ok(payload)
    }
}

impl From<MessagePayload> for PayloadInput {
    fn from(payload: MessagePayload) -> Self {
        let kind = Some(payload.kind().as_str().to_string());
        match payload {
            MessagePayload::Text { text } => Self { kind, text: Some(text), ..Default::default() },
            MessagePayload::Image { file_url, file_name, file_size, mime_type, thumbnail_url } => Self {
                kind,
                file_url: Some(file_url),
                file_name: Some(file_name),
                file_size: Some(file_size),
                mime_type: Some(mime_type),
                thumbnail_url,
                ..Default::default()
            },
            MessagePayload::Document { file_url, file_name, file_size, mime_type } => Self {
                kind,
                file_url: Some(file_url),
                file_name: Some(file_name),
                file_size: Some(file_size),
                mime_type: Some(mime_type),
                ..Default::default()
            },
            MessagePayload::Voice { file_url, duration_secs, mime_type, file_size, thumbnail_url } => Self {
                kind,
                file_url: Some(file_url),
                duration_secs: Some(duration_secs),
                mime_type,
                file_size,
                thumbnail_url,
                ..Default::default()
            },
        }
    }
}

// --- Attachment ---

/// Result of a successful attachment upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    pub kind: MessageKind,
    pub file_url: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl AttachmentMetadata {
    /// Payload for the message that carries this attachment.
    pub fn into_payload(self) -> Result<MessagePayload, String> {
        match self.kind {
            MessageKind::Text => Err("text is not an attachment kind".into()),
            MessageKind::Image => Ok(MessagePayload::Image {
                file_url: self.file_url,
                file_name: self.file_name,
                file_size: self.file_size,
                mime_type: self.mime_type,
                thumbnail_url: self.thumbnail_url,
            }),
            MessageKind::Document => Ok(MessagePayload::Document {
                file_url: self.file_url,
                file_name: self.file_name,
                file_size: self.file_size,
                mime_type: self.mime_type,
            }),
            MessageKind::Voice => Ok(MessagePayload::Voice {
                file_url: self.file_url,
                duration_secs: self.duration_secs.unwrap_or(0),
                mime_type: Some(self.mime_type),
                file_size: Some(self.file_size),
                thumbnail_url: self.thumbnail_url,
            }),
        }
    }
}

// --- Message ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub payload: MessagePayload,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    /// Sender-chosen idempotency key, echoed back unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

// --- Conversation ---

/// Orders an unordered participant pair so that `(a, b)` and `(b, a)` map to
/// the same key.
pub fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<Uuid>,
    pub last_message_text: String,
    /// Messages addressed to each participant that are not yet read.
    pub unread_count: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participant_a == participant_id || self.participant_b == participant_id
    }

    /// The other side of the pair, or `None` if `participant_id` is not in it.
    pub fn other_participant(&self, participant_id: &str) -> Option<&str> {
        if self.participant_a == participant_id {
            Some(&self.participant_b)
        } else if self.participant_b == participant_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, participant_id: &str) -> u32 {
        self.unread_count.get(participant_id).copied().unwrap_or(0)
    }
}
