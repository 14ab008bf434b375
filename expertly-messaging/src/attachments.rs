//! Attachment uploads. Files go to object storage first; the resulting
//! metadata then becomes the payload of an ordinary message.

use async_trait::async_trait;
use uuid::Uuid;

use expertly_shared::clients::minio::MinioClient;
use expertly_shared::errors::{AppError, ErrorCode};
use expertly_shared::types::{AttachmentMetadata, MessageKind};

use crate::config::AppConfig;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif", "image/heic"];
const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "text/csv",
    "application/zip",
];
const VOICE_TYPES: &[&str] = &[
    "audio/webm",
    "audio/ogg",
    "audio/mpeg",
    "audio/mp4",
    "audio/aac",
    "audio/wav",
    "audio/x-m4a",
];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{kind} attachments are limited to {limit} bytes, got {size}")]
    TooLarge { kind: MessageKind, size: u64, limit: u64 },

    #[error("{mime_type} is not an allowed {kind} type")]
    DisallowedType { kind: MessageKind, mime_type: String },

    #[error("{0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::TooLarge { .. } => AppError::new(ErrorCode::PayloadTooLarge, err.to_string()),
            UploadError::DisallowedType { .. } | UploadError::Invalid(_) => {
                AppError::new(ErrorCode::UploadRejected, err.to_string())
            }
            UploadError::Storage(cause) => {
                tracing::error!(error = %cause, "attachment storage failed");
                AppError::new(ErrorCode::ServiceUnavailable, "attachment storage unavailable")
            }
        }
    }
}

/// A file received from a client, not yet stored.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub kind: MessageKind,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    /// Voice notes only.
    pub duration_secs: Option<u32>,
}

/// Per-kind size caps in bytes.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentLimits {
    pub image: u64,
    pub document: u64,
    pub voice: u64,
}

impl AttachmentLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            image: config.max_image_bytes,
            document: config.max_document_bytes,
            voice: config.max_voice_bytes,
        }
    }

    pub fn for_kind(&self, kind: MessageKind) -> u64 {
        match kind {
            MessageKind::Text => 0,
            MessageKind::Image => self.image,
            MessageKind::Document => self.document,
            MessageKind::Voice => self.voice,
        }
    }

    /// Largest body any upload may carry.
    pub fn max(&self) -> u64 {
        self.image.max(self.document).max(self.voice)
    }
}

fn allowed_types(kind: MessageKind) -> &'static [&'static str] {
    match kind {
        MessageKind::Text => &[],
        MessageKind::Image => IMAGE_TYPES,
        MessageKind::Document => DOCUMENT_TYPES,
        MessageKind::Voice => VOICE_TYPES,
    }
}

/// Checks kind, type and size before anything is stored.
pub fn validate_upload(upload: &AttachmentUpload, limits: &AttachmentLimits) -> Result<(), UploadError> {
    if !upload.kind.is_attachment() {
        return Err(UploadError::Invalid("text is not an attachment kind".into()));
    }
    if upload.bytes.is_empty() {
        return Err(UploadError::Invalid("attachment is empty".into()));
    }
    if upload.file_name.trim().is_empty() {
        return Err(UploadError::Invalid("attachment needs a file name".into()));
    }

    // Parameters such as `;codecs=opus` do not affect the check.
    let essence = upload
        .mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !allowed_types(upload.kind).contains(&essence.as_str()) {
        return Err(UploadError::DisallowedType {
            kind: upload.kind,
            mime_type: upload.mime_type.clone(),
        });
    }

    let size = upload.bytes.len() as u64;
    let limit = limits.for_kind(upload.kind);
    if size > limit {
        return Err(UploadError::TooLarge { kind: upload.kind, size, limit });
    }
    Ok(())
}

/// Object key: `{kind}/{uploader}/{uuid}.{ext}`. The client's file name is
/// kept in metadata only.
pub fn object_key(kind: MessageKind, uploader_id: &str, file_name: &str) -> String {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    let uploader: String = uploader_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{kind}/{uploader}/{}{ext}", Uuid::new_v4())
}

#[async_trait]
pub trait AttachmentPipeline: Send + Sync {
    async fn upload(&self, uploader_id: &str, upload: AttachmentUpload) -> Result<AttachmentMetadata, UploadError>;
}

pub struct MinioAttachmentPipeline {
    minio: MinioClient,
    limits: AttachmentLimits,
}

impl MinioAttachmentPipeline {
    pub fn new(minio: MinioClient, limits: AttachmentLimits) -> Self {
        Self { minio, limits }
    }
}

#[async_trait]
impl AttachmentPipeline for MinioAttachmentPipeline {
    async fn upload(&self, uploader_id: &str, upload: AttachmentUpload) -> Result<AttachmentMetadata, UploadError> {
        validate_upload(&upload, &self.limits)?;

        let key = object_key(upload.kind, uploader_id, &upload.file_name);
        let file_size = upload.bytes.len() as u64;
        let file_url = self
            .minio
            .upload(&key, upload.bytes, &upload.mime_type)
            .await
            .map_err(UploadError::Storage)?;

        tracing::info!(kind = %upload.kind, key = %key, size = file_size, "attachment stored");
        metrics::counter!("chat_attachments_uploaded_total", "kind" => upload.kind.as_str()).increment(1);

        Ok(AttachmentMetadata {
            kind: upload.kind,
            file_url,
            file_name: upload.file_name,
            file_size,
            mime_type: upload.mime_type,
            duration_secs: upload.duration_secs,
            thumbnail_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AttachmentLimits {
        AttachmentLimits { image: 16, document: 32, voice: 8 }
    }

    fn upload(kind: MessageKind, mime: &str, size: usize) -> AttachmentUpload {
        AttachmentUpload {
            kind,
            file_name: "file.bin".into(),
            mime_type: mime.into(),
            bytes: vec![0u8; size],
            duration_secs: None,
        }
    }

    #[test]
    fn body_limit_covers_the_largest_kind() {
        assert_eq!(limits().max(), 32);
        assert_eq!(limits().for_kind(MessageKind::Voice), 8);
    }

    #[test]
    fn accepts_allowed_type_within_limit() {
        assert!(validate_upload(&upload(MessageKind::Image, "image/png", 16), &limits()).is_ok());
        assert!(validate_upload(&upload(MessageKind::Voice, "audio/webm;codecs=opus", 8), &limits()).is_ok());
    }

    #[test]
    fn rejects_oversized_per_kind() {
        let err = validate_upload(&upload(MessageKind::Voice, "audio/ogg", 9), &limits()).unwrap_err();
        assert!(matches!(err, UploadError::TooLarge { limit: 8, size: 9, .. }));
        // Same size is fine for a document.
        assert!(validate_upload(&upload(MessageKind::Document, "application/pdf", 9), &limits()).is_ok());
    }

    #[test]
    fn rejects_type_not_allowed_for_kind() {
        let err = validate_upload(&upload(MessageKind::Image, "application/pdf", 4), &limits()).unwrap_err();
        assert!(matches!(err, UploadError::DisallowedType { .. }));
    }

    #[test]
    fn rejects_text_and_empty_files() {
        assert!(matches!(
            validate_upload(&upload(MessageKind::Text, "text/plain", 4), &limits()),
            Err(UploadError::Invalid(_))
        ));
        assert!(matches!(
            validate_upload(&upload(MessageKind::Image, "image/png", 0), &limits()),
            Err(UploadError::Invalid(_))
        ));
    }

    #[test]
    fn object_key_is_sanitized() {
        let key = object_key(MessageKind::Document, "user/../x", "Brief.Final.PDF");
        assert!(key.starts_with("document/user____x/"));
        assert!(key.ends_with(".pdf"));

        let no_ext = object_key(MessageKind::Voice, "u1", "recording");
        assert!(!no_ext.contains('.'));
    }

    #[test]
    fn errors_map_to_api_codes() {
        let (code, _) = AppError::from(UploadError::TooLarge {
            kind: MessageKind::Image,
            size: 2,
            limit: 1,
        })
        .code_and_message();
        assert_eq!(code, "E0009");

        let (code, message) = AppError::from(UploadError::Storage("s3 timeout".into())).code_and_message();
        assert_eq!(code, "E0007");
        assert!(!message.contains("s3"));
    }
}
