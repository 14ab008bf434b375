#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use expertly_messaging::attachments::{validate_upload, AttachmentLimits, AttachmentPipeline, AttachmentUpload, UploadError};
use expertly_messaging::config::AppConfig;
use expertly_messaging::events::NoopEvents;
use expertly_messaging::rooms::{LocalRoomHub, SessionId};
use expertly_messaging::service::ChatService;
use expertly_messaging::store::MemoryChatStore;
use expertly_messaging::AppState;
use expertly_shared::middleware::encode_token;
use expertly_shared::types::auth::{Claims, UserRole};
use expertly_shared::types::{AttachmentMetadata, ServerEvent};

pub const SECRET: &str = "integration-secret";

/// Stores nothing; validates like the real pipeline and hands back a
/// predictable URL.
pub struct InMemoryFiles {
    limits: AttachmentLimits,
}

impl InMemoryFiles {
    pub fn new(config: &AppConfig) -> Self {
        Self { limits: AttachmentLimits::from_config(config) }
    }
}

#[async_trait]
impl AttachmentPipeline for InMemoryFiles {
    async fn upload(&self, uploader_id: &str, upload: AttachmentUpload) -> Result<AttachmentMetadata, UploadError> {
        validate_upload(&upload, &self.limits)?;
        Ok(AttachmentMetadata {
            kind: upload.kind,
            file_url: format!("http://files.test/{}/{uploader_id}/{}", upload.kind, upload.file_name),
            file_name: upload.file_name,
            file_size: upload.bytes.len() as u64,
            mime_type: upload.mime_type,
            duration_secs: upload.duration_secs,
            thumbnail_url: None,
        })
    }
}

pub fn config() -> AppConfig {
    AppConfig {
        jwt_secret: SECRET.to_string(),
        max_image_bytes: 1024,
        max_document_bytes: 2048,
        max_voice_bytes: 1024,
        ..AppConfig::default()
    }
}

pub fn state() -> Arc<AppState> {
    let config = config();
    let files = InMemoryFiles::new(&config);
    let chat = ChatService::new(
        Arc::new(MemoryChatStore::new()),
        Arc::new(LocalRoomHub::new()),
        Arc::new(NoopEvents),
        Arc::new(files),
    );
    Arc::new(AppState { config, chat, metrics: None })
}

pub fn bearer(user_id: &str, role: UserRole) -> String {
    let token = encode_token(&Claims::new(user_id, role, 3600), SECRET).expect("token");
    format!("Bearer {token}")
}

/// Registers a realtime session and returns the receiving end of its outbox.
pub fn connect(chat: &ChatService, session: &str, user_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    chat.connect(SessionId::from(session), user_id.to_string(), tx);
    rx
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
