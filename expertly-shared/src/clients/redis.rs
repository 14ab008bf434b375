use futures_lite::stream::Boxed;
use futures_lite::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("connected to Redis");
        Ok(Self { client, conn })
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Publish on a pub/sub channel; returns the number of receiving subscribers.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.publish(channel, payload).await
    }

    /// Subscribe to a pub/sub channel and stream the string payloads.
    ///
    /// Uses a dedicated connection; the stream ends when that connection drops.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Boxed<String>, redis::RedisError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        tracing::info!(channel = %channel, "subscribed to Redis channel");

        Ok(pubsub.into_on_message().filter_map(|msg| {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping non-string pub/sub payload");
                    None
                }
            }
        })
        .boxed())
    }
}
