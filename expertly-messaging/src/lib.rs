//! expertly messaging service: one-to-one client/expert conversations with
//! realtime delivery over Socket.IO and a REST surface for history.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use expertly_shared::middleware::{metrics_middleware, JwtSecret};

pub mod attachments;
pub mod broadcast;
pub mod config;
pub mod events;
pub mod models;
pub mod rooms;
pub mod routes;
pub mod schema;
pub mod service;
pub mod socket;
pub mod store;

use attachments::AttachmentLimits;
use config::AppConfig;
use service::ChatService;

pub struct AppState {
    pub config: AppConfig,
    pub chat: ChatService,
    pub metrics: Option<PrometheusHandle>,
}

/// Multipart framing on top of the largest allowed attachment.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// REST routes with the shared middleware stack. The realtime layer is added
/// by the binary.
pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = AttachmentLimits::from_config(&state.config).max() + MULTIPART_OVERHEAD;

    Router::new()
        // Health
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        // Conversations
        .route(
            "/conversations",
            get(routes::conversations::list_conversations).post(routes::conversations::create_conversation),
        )
        .route("/conversations/:id", get(routes::conversations::get_conversation))
        .route("/unread-count", get(routes::conversations::unread_count))
        // Messages
        .route(
            "/conversations/:id/messages",
            get(routes::messages::list_messages).post(routes::messages::send_message),
        )
        .route("/conversations/:id/read", post(routes::messages::mark_read))
        // Attachments
        .route(
            "/attachments",
            post(routes::attachments::upload_attachment)
                .layer(DefaultBodyLimit::max(upload_limit as usize)),
        )
        .layer(Extension(JwtSecret(state.config.jwt_secret.clone())))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
