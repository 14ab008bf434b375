use std::sync::Arc;

use socketioxide::SocketIo;

use expertly_messaging::attachments::{AttachmentLimits, MinioAttachmentPipeline};
use expertly_messaging::config::{AppConfig, StoreBackend};
use expertly_messaging::events::{DomainEvents, NoopEvents, RabbitPublisher};
use expertly_messaging::rooms::{LocalRoomHub, RedisRoomHub, RoomHub};
use expertly_messaging::service::ChatService;
use expertly_messaging::store::{ChatStore, MemoryChatStore, PgChatStore};
use expertly_messaging::{router, socket, AppState};
use expertly_shared::clients::db::create_pool;
use expertly_shared::clients::minio::MinioClient;
use expertly_shared::clients::rabbitmq::RabbitMQClient;
use expertly_shared::clients::redis::RedisClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    expertly_shared::middleware::init_tracing("expertly-messaging");
    let metrics = expertly_shared::middleware::init_metrics()?;

    let config = AppConfig::load()?;
    let port = config.port;

    let store: Arc<dyn ChatStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database_url, config.db_pool_size)?;
            Arc::new(PgChatStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; conversations are lost on restart");
            Arc::new(MemoryChatStore::new())
        }
    };

    let local_hub = Arc::new(LocalRoomHub::new());
    let hub: Arc<dyn RoomHub> = match config.redis() {
        Some(url) => {
            let redis = RedisClient::connect(url).await?;
            RedisRoomHub::start(redis, local_hub).await?
        }
        None => local_hub,
    };

    let events: Arc<dyn DomainEvents> = match config.rabbitmq() {
        Some(url) => Arc::new(RabbitPublisher::new(RabbitMQClient::connect(url).await?)),
        None => {
            tracing::info!("no RabbitMQ configured, domain events disabled");
            Arc::new(NoopEvents)
        }
    };

    let minio = MinioClient::new(
        &config.minio_endpoint,
        &config.minio_access_key,
        &config.minio_secret_key,
        &config.minio_bucket,
        &config.minio_public_url,
    )
    .await;
    let attachments = Arc::new(MinioAttachmentPipeline::new(minio, AttachmentLimits::from_config(&config)));

    let chat = ChatService::new(store, hub, events, attachments);
    let state = Arc::new(AppState {
        config,
        chat,
        metrics: Some(metrics),
    });

    let (sio_layer, io) = SocketIo::builder().build_layer();
    io.ns("/", {
        let state = state.clone();
        move |socket: socketioxide::extract::SocketRef| {
            let state = state.clone();
            async move {
                socket::handlers::on_connect_with_state(socket, state).await;
            }
        }
    });

    let app = router(state).layer(sio_layer);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "expertly-messaging starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
