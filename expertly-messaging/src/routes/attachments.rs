use axum::extract::{Multipart, State};
use axum::Json;
use std::sync::Arc;

use expertly_shared::errors::{AppError, AppResult, ErrorCode};
use expertly_shared::types::api::ApiResponse;
use expertly_shared::types::auth::AuthUser;
use expertly_shared::types::{AttachmentMetadata, MessageKind};

use crate::attachments::AttachmentUpload;
use crate::AppState;

/// POST /attachments
///
/// Multipart fields: `file` (required), `kind` (`image`, `document` or
/// `voice`; required) and `duration` (seconds, voice notes; `duration_secs`
/// is accepted too).
pub async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> AppResult<Json<ApiResponse<AttachmentMetadata>>> {
    let mut file: Option<(Vec<u8>, String, String)> = None; // (bytes, content_type, file_name)
    let mut kind: Option<MessageKind> = None;
    let mut duration_secs: Option<u32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("failed to read file: {e}")))?;
                file = Some((data.to_vec(), content_type, file_name));
            }
            "kind" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("invalid kind: {e}")))?;
                kind = Some(
                    text.trim()
                        .parse()
                        .map_err(|e: String| AppError::new(ErrorCode::ValidationError, e))?,
                );
            }
            "duration" | "duration_secs" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("invalid duration: {e}")))?;
                duration_secs = Some(text.trim().parse().map_err(|_| {
                    AppError::new(ErrorCode::ValidationError, "duration_secs must be a whole number")
                })?);
            }
            _ => {}
        }
    }

    let (bytes, mime_type, file_name) =
        file.ok_or_else(|| AppError::new(ErrorCode::ValidationError, "file field is required"))?;
    let kind = kind.ok_or_else(|| AppError::new(ErrorCode::ValidationError, "kind field is required"))?;

    let metadata = state
        .chat
        .upload_attachment(
            &auth.id,
            AttachmentUpload {
                kind,
                file_name,
                mime_type,
                bytes,
                duration_secs,
            },
        )
        .await?;
    Ok(Json(ApiResponse::ok(metadata)))
}
