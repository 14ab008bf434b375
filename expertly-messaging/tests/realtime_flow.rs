//! End-to-end conversations: client sessions talking to the service through
//! an in-process transport, with every server event fed back to the client.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use expertly_chat_client::{
    AttachmentFile, ChatSession, ChatTransport, ClientAction, ClientError, EntryId, TransportError,
};
use expertly_messaging::attachments::AttachmentUpload;
use expertly_messaging::events::NoopEvents;
use expertly_messaging::rooms::{LocalRoomHub, SessionId};
use expertly_messaging::service::ChatService;
use expertly_messaging::store::{
    ChatStore, CreatedMessage, MemoryChatStore, NewMessage, ReadOutcome, StoreError, StoreResult,
};
use expertly_shared::errors::AppError;
use expertly_shared::types::{
    AttachmentMetadata, Conversation, Message, MessageKind, MessageStatus, SendMessageCommand, ServerEvent,
    TypingCommand,
};

/// Calls the service the way the socket handlers do: commands are
/// fire-and-forget, failures come back as `error` events.
struct Loopback {
    chat: ChatService,
    session: SessionId,
    user_id: String,
}

fn rejected(err: AppError) -> TransportError {
    let (code, message) = err.code_and_message();
    TransportError::Rejected { code: code.to_string(), message }
}

#[async_trait]
impl ChatTransport for Loopback {
    async fn send_message(&self, command: SendMessageCommand) -> Result<(), TransportError> {
        let client_key = command.client_key.clone();
        if let Err(e) = self.chat.send_message(&self.user_id, command).await {
            self.chat.report_error(&self.session, &e, client_key);
        }
        Ok(())
    }

    async fn mark_read(&self, conversation_id: Uuid) -> Result<(), TransportError> {
        self.chat.mark_read(conversation_id, &self.user_id).await.map(|_| ()).map_err(rejected)
    }

    async fn set_typing(&self, command: TypingCommand) -> Result<(), TransportError> {
        self.chat
            .typing(&self.session, command.conversation_id, command.is_typing)
            .map_err(rejected)
    }

    async fn upload_attachment(
        &self,
        file: AttachmentFile,
        progress: mpsc::UnboundedSender<u8>,
    ) -> Result<AttachmentMetadata, TransportError> {
        let _ = progress.send(50);
        let metadata = self
            .chat
            .upload_attachment(
                &self.user_id,
                AttachmentUpload {
                    kind: file.kind,
                    file_name: file.file_name,
                    mime_type: file.mime_type,
                    bytes: file.bytes,
                    duration_secs: file.duration_secs,
                },
            )
            .await
            .map_err(rejected)?;
        let _ = progress.send(100);
        Ok(metadata)
    }
}

struct Device {
    session: ChatSession<Loopback>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Device {
    async fn join(chat: &ChatService, session: &str, user_id: &str, peer_id: &str, conversation_id: Uuid) -> Self {
        let events = common::connect(chat, session, user_id);
        let session_id = SessionId::from(session);
        chat.join(&session_id, conversation_id).await.expect("join");
        let transport = Loopback { chat: chat.clone(), session: session_id, user_id: user_id.to_string() };
        Self {
            session: ChatSession::new(transport, conversation_id, user_id, peer_id),
            events,
        }
    }

    /// Feeds every pending server event to the client.
    async fn pump(&mut self) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            actions.extend(self.session.handle_event(&event).await);
        }
        actions
    }
}

fn service(store: Arc<dyn ChatStore>) -> ChatService {
    let files = common::InMemoryFiles::new(&common::config());
    ChatService::new(store, Arc::new(LocalRoomHub::new()), Arc::new(NoopEvents), Arc::new(files))
}

async fn conversation(chat: &ChatService) -> Uuid {
    chat.create_conversation("u1", "u2").await.expect("conversation").id
}

#[tokio::test]
async fn provisional_message_is_replaced_by_the_confirmed_one() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;

    let temp_id = u1.session.send_text("hi").await.expect("send");
    assert_eq!(temp_id, "temp-1");
    u1.pump().await;

    let stored = chat.store().list_messages(conversation_id).await.expect("messages");
    assert_eq!(stored.len(), 1);

    let entries = u1.session.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, EntryId::Confirmed(stored[0].id));
    assert_eq!(entries[0].payload.text_body(), Some("hi"));
}

#[tokio::test]
async fn rejected_upload_creates_nothing() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;

    let file = AttachmentFile {
        kind: MessageKind::Image,
        file_name: "setup.exe".into(),
        mime_type: "application/x-msdownload".into(),
        bytes: vec![1; 64],
        duration_secs: None,
    };
    let err = u1.session.send_attachment(file).await.unwrap_err();
    assert!(matches!(err, ClientError::Upload(TransportError::Rejected { ref code, .. }) if code == "E4005"));

    assert!(u1.pump().await.is_empty());
    assert!(u1.session.snapshot().await.is_empty());
    assert!(chat.store().list_messages(conversation_id).await.expect("messages").is_empty());
}

#[tokio::test]
async fn accepted_upload_becomes_an_attachment_message() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;

    let file = AttachmentFile {
        kind: MessageKind::Voice,
        file_name: "note.ogg".into(),
        mime_type: "audio/ogg".into(),
        bytes: vec![3; 200],
        duration_secs: Some(4),
    };
    u1.session.send_attachment(file).await.expect("send");
    u1.pump().await;

    let entries = u1.session.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_provisional());
    assert_eq!(entries[0].payload.kind(), MessageKind::Voice);
    assert_eq!(entries[0].payload.file_url(), Some("http://files.test/voice/u1/note.ogg"));
}

#[tokio::test]
async fn every_session_of_the_sender_gets_the_echo() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut laptop = Device::join(&chat, "u1-laptop", "u1", "u2", conversation_id).await;
    let mut phone = Device::join(&chat, "u1-phone", "u1", "u2", conversation_id).await;

    laptop.session.send_text("from the laptop").await.expect("send");
    laptop.pump().await;
    phone.pump().await;

    let on_laptop = laptop.session.snapshot().await;
    let on_phone = phone.session.snapshot().await;
    assert_eq!(on_laptop.len(), 1);
    assert_eq!(on_phone.len(), 1);
    assert_eq!(on_laptop[0].id, on_phone[0].id);
    assert!(!on_phone[0].is_provisional());
}

#[tokio::test]
async fn hello_delivered_then_read() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;

    u1.session.send_text("hello").await.expect("send");
    u1.pump().await;
    let conv = chat.store().get_conversation(conversation_id).await.expect("conversation");
    assert_eq!(conv.unread_for("u2"), 1);
    assert_eq!(conv.last_message_text, "hello");

    // u2 comes online: joining marks the message delivered.
    let mut u2 = Device::join(&chat, "u2-web", "u2", "u1", conversation_id).await;
    u1.pump().await;
    assert_eq!(u1.session.snapshot().await[0].status, MessageStatus::Delivered);

    let history = chat.store().list_messages(conversation_id).await.expect("messages");
    u2.session.load_history(history).await;
    u2.session.open().await;
    u2.pump().await;
    u1.pump().await;

    let conv = chat.store().get_conversation(conversation_id).await.expect("conversation");
    assert_eq!(conv.unread_for("u2"), 0);
    let mine = &u1.session.snapshot().await[0];
    assert_eq!(mine.status, MessageStatus::Read);
    assert!(mine.read_at.is_some());

    // While open, further messages are read as they arrive.
    u1.session.send_text("still there?").await.expect("send");
    u2.pump().await;
    u1.pump().await;
    let conv = chat.store().get_conversation(conversation_id).await.expect("conversation");
    assert_eq!(conv.unread_for("u2"), 0);
    assert!(u1.session.snapshot().await.iter().all(|e| e.status == MessageStatus::Read));
}

#[tokio::test]
async fn typing_reaches_the_other_participant_only() {
    let chat = service(Arc::new(MemoryChatStore::new()));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;
    let mut u2 = Device::join(&chat, "u2-web", "u2", "u1", conversation_id).await;
    u1.pump().await;
    u2.pump().await;

    u1.session.on_input().await;
    u2.pump().await;
    assert_eq!(u2.session.typing_users().await, vec!["u1".to_string()]);
    assert!(u1.events.try_recv().is_err());

    u1.session.close().await;
    u2.pump().await;
    assert!(u2.session.typing_users().await.is_empty());
}

/// Accepts everything except new messages.
struct BrokenWrites(MemoryChatStore);

#[async_trait]
impl ChatStore for BrokenWrites {
    async fn find_or_create_conversation(&self, a: &str, b: &str) -> StoreResult<Conversation> {
        self.0.find_or_create_conversation(a, b).await
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
        self.0.get_conversation(id).await
    }

    async fn list_conversations(&self, participant_id: &str) -> StoreResult<Vec<Conversation>> {
        self.0.list_conversations(participant_id).await
    }

    async fn unread_total(&self, participant_id: &str) -> StoreResult<u64> {
        self.0.unread_total(participant_id).await
    }

    async fn create_message(&self, _new: NewMessage) -> StoreResult<CreatedMessage> {
        Err(StoreError::Persistence("disk full".into()))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        self.0.list_messages(conversation_id).await
    }

    async fn list_messages_page(&self, conversation_id: Uuid, offset: i64, limit: i64) -> StoreResult<(Vec<Message>, i64)> {
        self.0.list_messages_page(conversation_id, offset, limit).await
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<ReadOutcome> {
        self.0.mark_read(conversation_id, reader_id).await
    }

    async fn mark_delivered(&self, conversation_id: Uuid, recipient_id: &str) -> StoreResult<u64> {
        self.0.mark_delivered(conversation_id, recipient_id).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.0.ping().await
    }
}

#[tokio::test]
async fn persistence_failure_rolls_back_the_provisional_entry() {
    let chat = service(Arc::new(BrokenWrites(MemoryChatStore::new())));
    let conversation_id = conversation(&chat).await;
    let mut u1 = Device::join(&chat, "u1-web", "u1", "u2", conversation_id).await;

    let temp_id = u1.session.send_text("lost").await.expect("send is fire-and-forget");
    let actions = u1.pump().await;

    assert_eq!(actions.len(), 1);
    match &actions[0] {
        ClientAction::SendFailed { temp_id: failed, code, message } => {
            assert_eq!(failed, &temp_id);
            assert_eq!(code, "E4006");
            assert!(!message.contains("disk full"));
        }
        other => panic!("unexpected action {other:?}"),
    }
    assert!(u1.session.snapshot().await.is_empty());
}
