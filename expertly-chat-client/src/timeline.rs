use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use expertly_shared::types::{
    AttachmentMetadata, Message, MessageKind, MessagePayload, MessageStatus, SendMessageCommand,
    ServerEvent,
};

/// How far apart a provisional entry and a key-less server echo may be and
/// still be treated as the same message.
pub const MATCH_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    /// Local id of an entry the server has not confirmed yet (`temp-N`).
    Provisional(String),
    Confirmed(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: EntryId,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub payload: MessagePayload,
    pub status: MessageStatus,
    /// Local clock for provisional entries, server clock once confirmed.
    pub timestamp: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub client_key: Option<String>,
    /// Percentage, set only while an attachment is uploading.
    pub upload_progress: Option<u8>,
}

impl TimelineEntry {
    pub fn is_provisional(&self) -> bool {
        matches!(self.id, EntryId::Provisional(_))
    }

    fn temp_id(&self) -> Option<&str> {
        match &self.id {
            EntryId::Provisional(temp_id) => Some(temp_id),
            EntryId::Confirmed(_) => None,
        }
    }
}

impl From<Message> for TimelineEntry {
    fn from(message: Message) -> Self {
        Self {
            id: EntryId::Confirmed(message.id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            payload: message.payload,
            status: message.status,
            timestamp: message.timestamp,
            read_at: message.read_at,
            client_key: message.client_key,
            upload_progress: None,
        }
    }
}

/// What `apply_confirmed` did with a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Already present under its server id.
    Duplicate,
    /// Took the place of a provisional entry.
    Replaced { temp_id: String },
    /// New to this timeline (another device, or the other participant).
    Appended,
    /// Belongs to a different conversation.
    Ignored,
}

/// Follow-up the owner of the timeline should carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    MarkRead { conversation_id: Uuid },
    SendFailed { temp_id: String, code: String, message: String },
}

/// A provisional entry and the command that asks the server to persist it.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub temp_id: String,
    pub command: SendMessageCommand,
}

/// The visible message list of one conversation.
///
/// Confirmed entries are ordered by server timestamp; provisional entries
/// follow them in the order they were created.
#[derive(Debug)]
pub struct ConversationTimeline {
    conversation_id: Uuid,
    self_id: String,
    peer_id: String,
    entries: Vec<TimelineEntry>,
    open: bool,
    match_window: Duration,
    next_temp: u64,
}

impl ConversationTimeline {
    pub fn new(conversation_id: Uuid, self_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            conversation_id,
            self_id: self_id.into(),
            peer_id: peer_id.into(),
            entries: Vec::new(),
            open: false,
            match_window: Duration::seconds(MATCH_WINDOW_SECS),
            next_temp: 1,
        }
    }

    pub fn with_match_window(mut self, window: Duration) -> Self {
        self.match_window = window;
        self
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opening a conversation with unread inbound messages asks for a
    /// read-mark.
    pub fn set_open(&mut self, open: bool) -> Option<ClientAction> {
        self.open = open;
        (open && self.unread_inbound() > 0).then_some(ClientAction::MarkRead {
            conversation_id: self.conversation_id,
        })
    }

    /// Confirmed messages from the peer that are not read yet.
    pub fn unread_inbound(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.is_provisional() && e.sender_id == self.peer_id && e.status != MessageStatus::Read)
            .count()
    }

    /// Merges a fetched history page, e.g. after a reconnect.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.apply_confirmed(message);
        }
    }

    fn next_temp_id(&mut self) -> String {
        let id = format!("temp-{}", self.next_temp);
        self.next_temp += 1;
        id
    }

    fn push_provisional(&mut self, payload: MessagePayload, upload_progress: Option<u8>) -> (String, String) {
        let temp_id = self.next_temp_id();
        let client_key = Uuid::new_v4().to_string();
        self.entries.push(TimelineEntry {
            id: EntryId::Provisional(temp_id.clone()),
            conversation_id: self.conversation_id,
            sender_id: self.self_id.clone(),
            receiver_id: self.peer_id.clone(),
            payload,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            read_at: None,
            client_key: Some(client_key.clone()),
            upload_progress,
        });
        (temp_id, client_key)
    }

    fn command_for(&self, payload: MessagePayload, client_key: String) -> SendMessageCommand {
        SendMessageCommand {
            conversation_id: self.conversation_id,
            receiver_id: Some(self.peer_id.clone()),
            payload: payload.into(),
            client_key: Some(client_key),
        }
    }

    /// Inserts a provisional entry and returns the command to send.
    pub fn begin_send(&mut self, payload: MessagePayload) -> PendingSend {
        let (temp_id, client_key) = self.push_provisional(payload.clone(), None);
        PendingSend {
            command: self.command_for(payload, client_key),
            temp_id,
        }
    }

    /// Inserts a provisional attachment entry at 0% progress. Its payload
    /// points at a local placeholder until the upload finishes.
    pub fn begin_attachment(&mut self, kind: MessageKind, file_name: &str, file_size: u64, mime_type: &str) -> String {
        let placeholder = format!("local://{}/{file_name}", self.next_temp);
        let payload = match kind {
            MessageKind::Image => MessagePayload::Image {
                file_url: placeholder,
                file_name: file_name.to_string(),
                file_size,
                mime_type: mime_type.to_string(),
                thumbnail_url: None,
            },
            MessageKind::Voice => MessagePayload::Voice {
                file_url: placeholder,
                duration_secs: 0,
                mime_type: Some(mime_type.to_string()),
                file_size: Some(file_size),
                thumbnail_url: None,
            },
            MessageKind::Document | MessageKind::Text => MessagePayload::Document {
                file_url: placeholder,
                file_name: file_name.to_string(),
                file_size,
                mime_type: mime_type.to_string(),
            },
        };
        self.push_provisional(payload, Some(0)).0
    }

    pub fn set_upload_progress(&mut self, temp_id: &str, percent: u8) -> bool {
        match self.provisional_mut(temp_id) {
            Some(entry) => {
                entry.upload_progress = Some(percent.min(100));
                true
            }
            None => false,
        }
    }

    /// Swaps the placeholder for the stored file and returns the command to
    /// send. `None` if the entry is gone or the metadata is unusable.
    pub fn attachment_uploaded(&mut self, temp_id: &str, metadata: AttachmentMetadata) -> Option<PendingSend> {
        let payload = metadata.into_payload().ok()?;
        let entry = self.provisional_mut(temp_id)?;
        entry.payload = payload.clone();
        entry.upload_progress = None;
        let client_key = entry.client_key.clone()?;
        Some(PendingSend {
            temp_id: temp_id.to_string(),
            command: self.command_for(payload, client_key),
        })
    }

    /// Removes a provisional entry after a failed send or upload.
    pub fn rollback(&mut self, temp_id: &str) -> Option<TimelineEntry> {
        let pos = self.entries.iter().position(|e| e.temp_id() == Some(temp_id))?;
        tracing::debug!(temp_id, "rolling back provisional message");
        Some(self.entries.remove(pos))
    }

    fn provisional_mut(&mut self, temp_id: &str) -> Option<&mut TimelineEntry> {
        self.entries.iter_mut().find(|e| e.temp_id() == Some(temp_id))
    }

    /// Finds the provisional entry a server message confirms: by client key
    /// when the message carries one, otherwise by sender, kind, file URL and
    /// text within the match window, oldest first.
    fn find_provisional(&self, message: &Message) -> Option<usize> {
        if let Some(key) = message.client_key.as_deref() {
            return self
                .entries
                .iter()
                .position(|e| e.is_provisional() && e.client_key.as_deref() == Some(key));
        }

        self.entries.iter().position(|e| {
            e.is_provisional()
                && e.upload_progress.is_none()
                && e.sender_id == message.sender_id
                && e.conversation_id == message.conversation_id
                && e.payload.kind() == message.payload.kind()
                && e.payload.file_url() == message.payload.file_url()
                && e.payload.text_body() == message.payload.text_body()
                && (message.timestamp - e.timestamp).abs() <= self.match_window
        })
    }

    pub fn apply_confirmed(&mut self, message: Message) -> Reconciled {
        if message.conversation_id != self.conversation_id {
            return Reconciled::Ignored;
        }

        let id = EntryId::Confirmed(message.id);
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == id) {
            existing.status = existing.status.advance(message.status);
            if existing.read_at.is_none() {
                existing.read_at = message.read_at;
            }
            return Reconciled::Duplicate;
        }

        let outcome = match self.find_provisional(&message) {
            Some(pos) => {
                let temp_id = self.entries[pos].temp_id().unwrap_or_default().to_string();
                self.entries[pos] = TimelineEntry::from(message);
                Reconciled::Replaced { temp_id }
            }
            None => {
                self.entries.push(TimelineEntry::from(message));
                Reconciled::Appended
            }
        };
        self.sort();
        outcome
    }

    fn sort(&mut self) {
        // Stable: provisional entries keep their creation order.
        self.entries
            .sort_by(|a, b| (a.is_provisional(), a.timestamp).cmp(&(b.is_provisional(), b.timestamp)));
    }

    /// Applies one realtime event and returns the follow-ups it calls for.
    /// Typing events are not timeline state and are ignored here.
    pub fn apply_event(&mut self, event: &ServerEvent) -> Vec<ClientAction> {
        match event {
            ServerEvent::MessageCreated(message) => {
                let inbound = message.sender_id != self.self_id;
                let unread = message.status != MessageStatus::Read;
                let outcome = self.apply_confirmed(message.clone());
                if inbound && unread && self.open && outcome == Reconciled::Appended {
                    vec![ClientAction::MarkRead { conversation_id: self.conversation_id }]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::MessagesRead(receipt) if receipt.conversation_id == self.conversation_id => {
                for entry in self.entries.iter_mut().filter(|e| !e.is_provisional()) {
                    if entry.receiver_id == receipt.reader_id {
                        entry.status = entry.status.advance(MessageStatus::Read);
                        entry.read_at.get_or_insert(receipt.timestamp);
                    }
                }
                Vec::new()
            }
            ServerEvent::MessagesDelivered(receipt) if receipt.conversation_id == self.conversation_id => {
                for entry in self.entries.iter_mut().filter(|e| !e.is_provisional()) {
                    if entry.receiver_id == receipt.recipient_id {
                        entry.status = entry.status.advance(MessageStatus::Delivered);
                    }
                }
                Vec::new()
            }
            ServerEvent::Error(error) => {
                let Some(key) = error.client_key.as_deref() else {
                    return Vec::new();
                };
                let temp_id = self
                    .entries
                    .iter()
                    .find(|e| e.is_provisional() && e.client_key.as_deref() == Some(key))
                    .and_then(|e| e.temp_id())
                    .map(str::to_string);
                match temp_id {
                    Some(temp_id) => {
                        self.rollback(&temp_id);
                        vec![ClientAction::SendFailed {
                            temp_id,
                            code: error.code.clone(),
                            message: error.message.clone(),
                        }]
                    }
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use expertly_shared::types::{ErrorEvent, ReadReceipt};

    use super::*;

    fn timeline() -> ConversationTimeline {
        ConversationTimeline::new(Uuid::nil(), "c1", "e1")
    }

    fn server_copy(entry: &TimelineEntry, keep_key: bool) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id: entry.conversation_id,
            sender_id: entry.sender_id.clone(),
            receiver_id: entry.receiver_id.clone(),
            payload: entry.payload.clone(),
            status: MessageStatus::Sent,
            timestamp: entry.timestamp + Duration::milliseconds(40),
            read_at: None,
            client_key: if keep_key { entry.client_key.clone() } else { None },
        }
    }

    fn inbound(text: &str) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id: Uuid::nil(),
            sender_id: "e1".into(),
            receiver_id: "c1".into(),
            payload: MessagePayload::text(text),
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            read_at: None,
            client_key: None,
        }
    }

    #[test]
    fn echo_replaces_provisional_entry() {
        let mut tl = timeline();
        let pending = tl.begin_send(MessagePayload::text("hi"));
        assert_eq!(pending.temp_id, "temp-1");
        assert_eq!(tl.entries().len(), 1);

        let echo = server_copy(&tl.entries()[0], true);
        let server_id = echo.id;
        assert_eq!(tl.apply_confirmed(echo.clone()), Reconciled::Replaced { temp_id: "temp-1".into() });
        assert_eq!(tl.apply_confirmed(echo), Reconciled::Duplicate);

        assert_eq!(tl.entries().len(), 1);
        assert_eq!(tl.entries()[0].id, EntryId::Confirmed(server_id));
        assert_eq!(tl.entries()[0].payload.text_body(), Some("hi"));
    }

    #[test]
    fn keyless_echo_falls_back_to_content_match() {
        let mut tl = timeline();
        tl.begin_send(MessagePayload::text("same"));
        tl.begin_send(MessagePayload::text("same"));

        let first_echo = server_copy(&tl.entries()[0], false);
        assert_eq!(tl.apply_confirmed(first_echo), Reconciled::Replaced { temp_id: "temp-1".into() });
        assert!(tl.entries()[1].is_provisional());
    }

    #[test]
    fn stale_provisional_is_not_matched() {
        let mut tl = timeline().with_match_window(Duration::seconds(5));
        tl.begin_send(MessagePayload::text("hello"));
        let mut echo = server_copy(&tl.entries()[0], false);
        echo.timestamp += Duration::seconds(60);

        assert_eq!(tl.apply_confirmed(echo), Reconciled::Appended);
        assert_eq!(tl.entries().len(), 2);
    }

    #[test]
    fn message_from_other_device_is_appended_before_pending() {
        let mut tl = timeline();
        tl.begin_send(MessagePayload::text("draft"));
        let mut other_device = inbound("from my laptop");
        other_device.sender_id = "c1".into();
        other_device.receiver_id = "e1".into();
        other_device.client_key = Some("laptop-key".into());

        assert_eq!(tl.apply_confirmed(other_device), Reconciled::Appended);
        assert!(!tl.entries()[0].is_provisional());
        assert!(tl.entries()[1].is_provisional());
    }

    #[test]
    fn other_conversation_is_ignored() {
        let mut tl = timeline();
        let mut message = inbound("elsewhere");
        message.conversation_id = Uuid::now_v7();
        assert_eq!(tl.apply_confirmed(message), Reconciled::Ignored);
        assert!(tl.entries().is_empty());
    }

    #[test]
    fn inbound_message_triggers_mark_read_only_when_open() {
        let mut tl = timeline();
        let actions = tl.apply_event(&ServerEvent::MessageCreated(inbound("one")));
        assert!(actions.is_empty());

        assert_eq!(
            tl.set_open(true),
            Some(ClientAction::MarkRead { conversation_id: Uuid::nil() })
        );
        let actions = tl.apply_event(&ServerEvent::MessageCreated(inbound("two")));
        assert_eq!(actions, vec![ClientAction::MarkRead { conversation_id: Uuid::nil() }]);

        // Own echoes never do.
        let pending = tl.begin_send(MessagePayload::text("reply"));
        let echo = server_copy(tl.entries().last().unwrap(), true);
        assert_eq!(echo.client_key, pending.command.client_key);
        assert!(tl.apply_event(&ServerEvent::MessageCreated(echo)).is_empty());
    }

    #[test]
    fn read_receipt_flips_own_messages() {
        let mut tl = timeline();
        tl.begin_send(MessagePayload::text("question"));
        let echo = server_copy(&tl.entries()[0], true);
        tl.apply_confirmed(echo);
        tl.apply_confirmed(inbound("answer"));

        let at = Utc::now();
        tl.apply_event(&ServerEvent::MessagesRead(ReadReceipt {
            conversation_id: Uuid::nil(),
            reader_id: "e1".into(),
            timestamp: at,
        }));

        let mine = tl.entries().iter().find(|e| e.sender_id == "c1").unwrap();
        assert_eq!(mine.status, MessageStatus::Read);
        assert_eq!(mine.read_at, Some(at));
        let theirs = tl.entries().iter().find(|e| e.sender_id == "e1").unwrap();
        assert_eq!(theirs.status, MessageStatus::Sent);
    }

    #[test]
    fn late_sent_echo_does_not_regress_read() {
        let mut tl = timeline();
        let mut message = inbound("x");
        message.status = MessageStatus::Read;
        tl.apply_confirmed(message.clone());
        message.status = MessageStatus::Sent;
        assert_eq!(tl.apply_confirmed(message), Reconciled::Duplicate);
        assert_eq!(tl.entries()[0].status, MessageStatus::Read);
    }

    #[test]
    fn error_with_client_key_rolls_back() {
        let mut tl = timeline();
        let pending = tl.begin_send(MessagePayload::text("doomed"));
        let actions = tl.apply_event(&ServerEvent::Error(ErrorEvent {
            code: "E4006".into(),
            message: "failed to persist changes".into(),
            client_key: pending.command.client_key.clone(),
        }));
        assert_eq!(
            actions,
            vec![ClientAction::SendFailed {
                temp_id: pending.temp_id,
                code: "E4006".into(),
                message: "failed to persist changes".into(),
            }]
        );
        assert!(tl.entries().is_empty());
    }

    #[test]
    fn attachment_progress_then_upload() {
        let mut tl = timeline();
        let temp_id = tl.begin_attachment(MessageKind::Image, "cat.png", 2048, "image/png");
        assert_eq!(tl.entries()[0].upload_progress, Some(0));
        assert!(tl.set_upload_progress(&temp_id, 140));
        assert_eq!(tl.entries()[0].upload_progress, Some(100));

        let pending = tl
            .attachment_uploaded(
                &temp_id,
                AttachmentMetadata {
                    kind: MessageKind::Image,
                    file_url: "http://files/cat.png".into(),
                    file_name: "cat.png".into(),
                    file_size: 2048,
                    mime_type: "image/png".into(),
                    duration_secs: None,
                    thumbnail_url: None,
                },
            )
            .unwrap();
        assert_eq!(pending.command.payload.file_url.as_deref(), Some("http://files/cat.png"));
        assert_eq!(tl.entries()[0].upload_progress, None);

        assert!(tl.rollback(&temp_id).is_some());
        assert!(tl.attachment_uploaded(&temp_id, AttachmentMetadata {
            kind: MessageKind::Image,
            file_url: "u".into(),
            file_name: "n".into(),
            file_size: 1,
            mime_type: "image/png".into(),
            duration_secs: None,
            thumbnail_url: None,
        })
        .is_none());
    }
}
