use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use expertly_shared::errors::AppResult;
use expertly_shared::types::api::ApiResponse;
use expertly_shared::types::auth::AuthUser;
use expertly_shared::types::pagination::{Paginated, PaginationParams};
use expertly_shared::types::{Conversation, Message, PayloadInput, SendMessageCommand};

use crate::AppState;

// --- Request DTOs ---

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Optional; must name the other participant when present.
    #[serde(default)]
    pub receiver_id: Option<String>,
    pub payload: PayloadInput,
    #[serde(default)]
    pub client_key: Option<String>,
}

// --- Response DTOs ---

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub conversation_id: Uuid,
    pub count: u64,
    pub conversation: Conversation,
}

// --- Handlers ---

/// GET /conversations/:id/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
) -> AppResult<Json<ApiResponse<Paginated<Message>>>> {
    let page = state.chat.list_messages(conversation_id, &auth.id, &params).await?;
    Ok(Json(ApiResponse::ok(page)))
}

/// POST /conversations/:id/messages
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<ApiResponse<Message>>> {
    let message = state
        .chat
        .send_message(
            &auth.id,
            SendMessageCommand {
                conversation_id,
                receiver_id: req.receiver_id,
                payload: req.payload,
                client_key: req.client_key,
            },
        )
        .await?;
    Ok(Json(ApiResponse::ok(message)))
}

/// POST /conversations/:id/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<MarkReadResponse>>> {
    let outcome = state.chat.mark_read(conversation_id, &auth.id).await?;
    Ok(Json(ApiResponse::ok(MarkReadResponse {
        conversation_id,
        count: outcome.count,
        conversation: outcome.conversation,
    })))
}
