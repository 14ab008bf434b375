use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use expertly_shared::types::{
    AttachmentMetadata, Message, MessageKind, MessagePayload, SendMessageCommand, ServerEvent, TypingCommand,
};

use crate::error::{ClientError, TransportError};
use crate::timeline::{ClientAction, ConversationTimeline, TimelineEntry};
use crate::typing::{RemoteTyping, TypingTracker};

/// A raw file picked by the user.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub kind: MessageKind,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub duration_secs: Option<u32>,
}

/// Outbound half of the realtime channel plus the upload endpoint.
///
/// Sends are fire-and-forget: the confirmation arrives later as a
/// `message.created` event and is fed back through
/// [`ChatSession::handle_event`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, command: SendMessageCommand) -> Result<(), TransportError>;

    async fn mark_read(&self, conversation_id: Uuid) -> Result<(), TransportError>;

    async fn set_typing(&self, command: TypingCommand) -> Result<(), TransportError>;

    /// Uploads `file`, reporting percentages on `progress` as it goes.
    async fn upload_attachment(
        &self,
        file: AttachmentFile,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<AttachmentMetadata, TransportError>;
}

/// One open conversation on one device.
pub struct ChatSession<T> {
    transport: T,
    conversation_id: Uuid,
    self_id: String,
    timeline: Mutex<ConversationTimeline>,
    typing: Mutex<TypingTracker>,
    remote_typing: Mutex<RemoteTyping>,
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(transport: T, conversation_id: Uuid, self_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        Self {
            transport,
            conversation_id,
            timeline: Mutex::new(ConversationTimeline::new(conversation_id, self_id.clone(), peer_id)),
            self_id,
            typing: Mutex::new(TypingTracker::new()),
            remote_typing: Mutex::new(RemoteTyping::default()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn snapshot(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.entries().to_vec()
    }

    /// Merges fetched history, e.g. after (re)joining the room.
    pub async fn load_history(&self, messages: Vec<Message>) {
        self.timeline.lock().await.load_history(messages);
    }

    pub async fn open(&self) {
        let action = self.timeline.lock().await.set_open(true);
        if let Some(action) = action {
            self.run(action).await;
        }
    }

    pub async fn close(&self) {
        self.timeline.lock().await.set_open(false);
        self.stop_typing().await;
    }

    /// Shows the message immediately, then sends it. A failed send removes
    /// the provisional entry again. Returns the temp id.
    pub async fn send_text(&self, text: &str) -> Result<String, ClientError> {
        let payload = MessagePayload::text(text);
        payload.validate().map_err(ClientError::InvalidPayload)?;

        let pending = self.timeline.lock().await.begin_send(payload);
        self.stop_typing().await;

        if let Err(e) = self.transport.send_message(pending.command).await {
            tracing::warn!(temp_id = %pending.temp_id, error = %e, "send failed");
            self.timeline.lock().await.rollback(&pending.temp_id);
            return Err(ClientError::Send(e));
        }
        Ok(pending.temp_id)
    }

    /// Shows a provisional attachment with upload progress, uploads it and
    /// sends the message only once the upload succeeded.
    pub async fn send_attachment(&self, file: AttachmentFile) -> Result<String, ClientError> {
        let temp_id = self.timeline.lock().await.begin_attachment(
            file.kind,
            &file.file_name,
            file.bytes.len() as u64,
            &file.mime_type,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let upload = self.transport.upload_attachment(file, tx);
        tokio::pin!(upload);
        let uploaded = loop {
            tokio::select! {
                result = &mut upload => break result,
                Some(percent) = rx.recv() => {
                    self.timeline.lock().await.set_upload_progress(&temp_id, percent);
                }
            }
        };

        let metadata = match uploaded {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(%temp_id, error = %e, "attachment upload failed");
                self.timeline.lock().await.rollback(&temp_id);
                return Err(ClientError::Upload(e));
            }
        };

        let pending = self
            .timeline
            .lock()
            .await
            .attachment_uploaded(&temp_id, metadata)
            .ok_or(ClientError::Cancelled)?;

        if let Err(e) = self.transport.send_message(pending.command).await {
            tracing::warn!(%temp_id, error = %e, "send failed");
            self.timeline.lock().await.rollback(&temp_id);
            return Err(ClientError::Send(e));
        }
        Ok(temp_id)
    }

    /// Feeds one server event into local state. Read-marks are sent right
    /// away; the remaining actions (failed sends) are returned for display.
    pub async fn handle_event(&self, event: &ServerEvent) -> Vec<ClientAction> {
        if let ServerEvent::TypingState(state) = event {
            if state.conversation_id == self.conversation_id && state.user_id != self.self_id {
                self.remote_typing.lock().await.apply(state, Instant::now());
            }
            return Vec::new();
        }

        let actions = self.timeline.lock().await.apply_event(event);
        let mut unhandled = Vec::new();
        for action in actions {
            match action {
                ClientAction::MarkRead { .. } => self.run(action).await,
                other => unhandled.push(other),
            }
        }
        unhandled
    }

    async fn run(&self, action: ClientAction) {
        if let ClientAction::MarkRead { conversation_id } = action {
            if let Err(e) = self.transport.mark_read(conversation_id).await {
                tracing::warn!(%conversation_id, error = %e, "mark read failed");
            }
        }
    }

    /// Call on every keystroke in the composer.
    pub async fn on_input(&self) {
        let signal = self.typing.lock().await.on_input(Instant::now());
        self.signal_typing(signal).await;
    }

    /// Call periodically (about once a second) to emit typing stops and
    /// expire remote indicators.
    pub async fn tick(&self) {
        let now = Instant::now();
        let signal = self.typing.lock().await.poll(now);
        self.signal_typing(signal).await;
        self.remote_typing.lock().await.prune(now);
    }

    async fn stop_typing(&self) {
        let signal = self.typing.lock().await.stop();
        self.signal_typing(signal).await;
    }

    async fn signal_typing(&self, signal: Option<bool>) {
        let Some(is_typing) = signal else { return };
        let command = TypingCommand { conversation_id: self.conversation_id, is_typing };
        if let Err(e) = self.transport.set_typing(command).await {
            tracing::debug!(error = %e, "typing signal dropped");
        }
    }

    /// Other users currently typing in this conversation.
    pub async fn typing_users(&self) -> Vec<String> {
        self.remote_typing.lock().await.typing_in(self.conversation_id, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;
    use expertly_shared::types::{MessageStatus, TypingState};

    use super::*;
    use crate::timeline::EntryId;

    #[derive(Default)]
    struct FakeTransport {
        sent: StdMutex<Vec<SendMessageCommand>>,
        reads: StdMutex<Vec<Uuid>>,
        typing: StdMutex<Vec<bool>>,
        fail_send: bool,
        fail_upload: bool,
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        async fn send_message(&self, command: SendMessageCommand) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::Disconnected("socket closed".into()));
            }
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        async fn mark_read(&self, conversation_id: Uuid) -> Result<(), TransportError> {
            self.reads.lock().unwrap().push(conversation_id);
            Ok(())
        }

        async fn set_typing(&self, command: TypingCommand) -> Result<(), TransportError> {
            self.typing.lock().unwrap().push(command.is_typing);
            Ok(())
        }

        async fn upload_attachment(
            &self,
            file: AttachmentFile,
            progress: mpsc::UnboundedSender<u8>,
        ) -> Result<AttachmentMetadata, TransportError> {
            let _ = progress.send(40);
            if self.fail_upload {
                return Err(TransportError::Rejected {
                    code: "E0009".into(),
                    message: "image exceeds 10485760 bytes".into(),
                });
            }
            let _ = progress.send(100);
            Ok(AttachmentMetadata {
                kind: file.kind,
                file_url: format!("http://files/{}", file.file_name),
                file_name: file.file_name,
                file_size: file.bytes.len() as u64,
                mime_type: file.mime_type,
                duration_secs: file.duration_secs,
                thumbnail_url: None,
            })
        }
    }

    fn session(transport: FakeTransport) -> ChatSession<FakeTransport> {
        ChatSession::new(transport, Uuid::nil(), "c1", "e1")
    }

    fn echo(command: &SendMessageCommand) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id: command.conversation_id,
            sender_id: "c1".into(),
            receiver_id: "e1".into(),
            payload: MessagePayload::try_from(command.payload.clone()).unwrap(),
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            read_at: None,
            client_key: command.client_key.clone(),
        }
    }

    fn image() -> AttachmentFile {
        AttachmentFile {
            kind: MessageKind::Image,
            file_name: "cat.png".into(),
            mime_type: "image/png".into(),
            bytes: vec![0; 512],
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn send_then_echo_leaves_one_confirmed_entry() {
        let session = session(FakeTransport::default());
        let temp_id = session.send_text("hi").await.unwrap();
        assert_eq!(temp_id, "temp-1");
        assert!(session.snapshot().await[0].is_provisional());

        let command = session.transport().sent.lock().unwrap()[0].clone();
        let confirmed = echo(&command);
        let server_id = confirmed.id;
        session.handle_event(&ServerEvent::MessageCreated(confirmed)).await;

        let entries = session.snapshot().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, EntryId::Confirmed(server_id));
        assert_eq!(entries[0].payload.text_body(), Some("hi"));
    }

    #[tokio::test]
    async fn failed_send_rolls_back() {
        let session = session(FakeTransport { fail_send: true, ..Default::default() });
        let err = session.send_text("hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Send(TransportError::Disconnected(_))));
        assert!(session.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn blank_text_is_rejected_locally() {
        let session = session(FakeTransport::default());
        assert!(matches!(session.send_text("   ").await, Err(ClientError::InvalidPayload(_))));
        assert!(session.snapshot().await.is_empty());
        assert!(session.transport().sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attachment_is_sent_after_upload() {
        let session = session(FakeTransport::default());
        session.send_attachment(image()).await.unwrap();

        let sent = session.transport().sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.file_url.as_deref(), Some("http://files/cat.png"));

        let entries = session.snapshot().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].upload_progress, None);
        assert_eq!(entries[0].payload.file_url(), Some("http://files/cat.png"));
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_behind() {
        let session = session(FakeTransport { fail_upload: true, ..Default::default() });
        let err = session.send_attachment(image()).await.unwrap_err();
        assert!(matches!(err, ClientError::Upload(TransportError::Rejected { .. })));
        assert!(session.snapshot().await.is_empty());
        assert!(session.transport().sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_message_is_marked_read_while_open() {
        let session = session(FakeTransport::default());
        session.open().await;

        let inbound = Message {
            id: Uuid::now_v7(),
            conversation_id: Uuid::nil(),
            sender_id: "e1".into(),
            receiver_id: "c1".into(),
            payload: MessagePayload::text("hello"),
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
            read_at: None,
            client_key: None,
        };
        let actions = session.handle_event(&ServerEvent::MessageCreated(inbound)).await;
        assert!(actions.is_empty());
        assert_eq!(*session.transport().reads.lock().unwrap(), vec![Uuid::nil()]);
    }

    #[tokio::test]
    async fn server_error_returns_send_failed() {
        let session = session(FakeTransport::default());
        session.send_text("hi").await.unwrap();
        let key = session.transport().sent.lock().unwrap()[0].client_key.clone();

        let actions = session
            .handle_event(&ServerEvent::error("E4006", "failed to persist changes", key))
            .await;
        assert!(matches!(&actions[..], [ClientAction::SendFailed { code, .. }] if code == "E4006"));
        assert!(session.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn typing_signals_and_remote_state() {
        let session = session(FakeTransport::default());
        session.on_input().await;
        session.on_input().await;
        session.send_text("done").await.unwrap();
        assert_eq!(*session.transport().typing.lock().unwrap(), vec![true, false]);

        let state = TypingState { conversation_id: Uuid::nil(), user_id: "e1".into(), is_typing: true };
        session.handle_event(&ServerEvent::TypingState(state)).await;
        assert_eq!(session.typing_users().await, vec!["e1".to_string()]);

        let own = TypingState { conversation_id: Uuid::nil(), user_id: "c1".into(), is_typing: true };
        session.handle_event(&ServerEvent::TypingState(own)).await;
        assert_eq!(session.typing_users().await, vec!["e1".to_string()]);
    }
}
