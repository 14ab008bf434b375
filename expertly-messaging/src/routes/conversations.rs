use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use expertly_shared::errors::{AppError, AppResult, ErrorCode};
use expertly_shared::types::api::ApiResponse;
use expertly_shared::types::auth::{AuthUser, UserRole};
use expertly_shared::types::Conversation;

use crate::AppState;

// --- Request DTOs ---

#[derive(Debug, Deserialize, Validate)]
pub struct CreateConversationRequest {
    /// Defaults to the caller. Only admins may open a conversation between
    /// two other participants.
    #[validate(length(min = 1, message = "participant_a must not be empty"))]
    pub participant_a: Option<String>,
    #[validate(length(min = 1, message = "participant_b is required"))]
    pub participant_b: String,
}

// --- Response DTOs ---

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub total_unread: u64,
}

// --- Handlers ---

/// POST /conversations
pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(req): Json<CreateConversationRequest>,
) -> AppResult<Json<ApiResponse<Conversation>>> {
    req.validate()
        .map_err(|e| AppError::new(ErrorCode::ValidationError, e.to_string()))?;

    let participant_a = req.participant_a.unwrap_or_else(|| auth.id.clone());
    if auth.role != UserRole::Admin && participant_a != auth.id && req.participant_b != auth.id {
        return Err(AppError::forbidden("cannot open a conversation you are not part of"));
    }

    let conversation = state
        .chat
        .create_conversation(&participant_a, &req.participant_b)
        .await?;
    Ok(Json(ApiResponse::ok(conversation)))
}

/// GET /conversations
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> AppResult<Json<ApiResponse<Vec<Conversation>>>> {
    let conversations = state.chat.list_conversations(&auth.id).await?;
    Ok(Json(ApiResponse::ok(conversations)))
}

/// GET /conversations/:id
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Conversation>>> {
    let conversation = state.chat.conversation_for(conversation_id, &auth.id).await?;
    Ok(Json(ApiResponse::ok(conversation)))
}

/// GET /unread-count
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> AppResult<Json<ApiResponse<UnreadCountResponse>>> {
    let total_unread = state.chat.unread_total(&auth.id).await?;
    Ok(Json(ApiResponse::ok(UnreadCountResponse { total_unread })))
}
