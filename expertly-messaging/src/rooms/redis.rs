use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::stream::Boxed;
use futures_lite::{Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use expertly_shared::clients::redis::RedisClient;
use expertly_shared::types::ServerEvent;

use super::{LocalRoomHub, Outbox, RoomEnvelope, RoomHub, SessionId};

pub const ROOM_CHANNEL: &str = "expertly:messaging:rooms";

const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Hub for multi-instance deployments. Session bookkeeping stays local; room
/// events go through Redis pub/sub and every instance, this one included,
/// delivers them to its own sessions.
///
/// Envelopes are published one at a time, in call order, by a single task.
/// While the subscription is down, events are delivered locally instead.
pub struct RedisRoomHub {
    local: Arc<LocalRoomHub>,
    outbound: mpsc::UnboundedSender<RoomEnvelope>,
}

impl RedisRoomHub {
    pub async fn start(redis: RedisClient, local: Arc<LocalRoomHub>) -> Result<Arc<Self>, ::redis::RedisError> {
        let stream = redis.subscribe(ROOM_CHANNEL).await?;
        let subscribed = Arc::new(AtomicBool::new(true));

        tokio::spawn(keep_subscribed(redis.clone(), stream, local.clone(), subscribed.clone()));

        let (outbound, rx) = mpsc::unbounded_channel();
        {
            let local = local.clone();
            tokio::spawn(async move {
                let forwarded = forward(rx, &redis, &local, &subscribed).await;
                tracing::debug!(forwarded, "room publisher stopped");
            });
        }

        Ok(Arc::new(Self { local, outbound }))
    }
}

/// Where serialized envelopes are published.
#[async_trait]
pub(crate) trait EnvelopeSink: Send + Sync {
    async fn send(&self, payload: &str) -> Result<(), String>;
}

#[async_trait]
impl EnvelopeSink for RedisClient {
    async fn send(&self, payload: &str) -> Result<(), String> {
        self.publish(ROOM_CHANNEL, payload).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Drains the outbound queue in order. Falls back to local delivery when the
/// subscription is down or a publish fails. Returns the number of envelopes
/// handled once every sender is gone.
pub(crate) async fn forward<S: EnvelopeSink>(
    mut rx: mpsc::UnboundedReceiver<RoomEnvelope>,
    sink: &S,
    local: &LocalRoomHub,
    subscribed: &AtomicBool,
) -> usize {
    let mut handled = 0;
    while let Some(envelope) = rx.recv().await {
        handled += 1;
        if !subscribed.load(Ordering::Acquire) {
            local.deliver(&envelope);
            continue;
        }

        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize room envelope");
                local.deliver(&envelope);
                continue;
            }
        };
        if let Err(e) = sink.send(&payload).await {
            tracing::warn!(error = %e, "redis publish failed, delivering locally only");
            local.deliver(&envelope);
        }
    }
    handled
}

/// Relays the subscription to local sessions and resubscribes whenever it
/// ends. `subscribed` is cleared for as long as no subscription is active.
async fn keep_subscribed(
    redis: RedisClient,
    first: Boxed<String>,
    local: Arc<LocalRoomHub>,
    subscribed: Arc<AtomicBool>,
) {
    let mut relayed = relay(first, &local).await;
    loop {
        subscribed.store(false, Ordering::Release);
        tracing::warn!(relayed, "room subscription ended, delivering locally until resubscribed");

        let stream = resubscribe(&redis).await;
        subscribed.store(true, Ordering::Release);
        tracing::info!("room subscription restored");
        relayed = relay(stream, &local).await;
    }
}

async fn resubscribe(redis: &RedisClient) -> Boxed<String> {
    let mut backoff = Duration::from_millis(500);
    loop {
        tokio::time::sleep(backoff).await;
        match redis.subscribe(ROOM_CHANNEL).await {
            Ok(stream) => return stream,
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?backoff, "room resubscribe failed");
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
            }
        }
    }
}

/// Delivers every envelope from the subscription to local sessions. Returns
/// the number of envelopes handled once the stream ends.
pub(crate) async fn relay<S>(stream: S, local: &LocalRoomHub) -> usize
where
    S: Stream<Item = String>,
{
    futures_lite::pin!(stream);
    let mut relayed = 0;
    while let Some(payload) = stream.next().await {
        match serde_json::from_str::<RoomEnvelope>(&payload) {
            Ok(envelope) => {
                local.deliver(&envelope);
                relayed += 1;
            }
            Err(e) => tracing::warn!(error = %e, "dropping malformed room envelope"),
        }
    }
    relayed
}

impl RoomHub for RedisRoomHub {
    fn register(&self, session: SessionId, participant_id: String, outbox: Outbox) {
        self.local.register(session, participant_id, outbox);
    }

    fn participant_of(&self, session: &SessionId) -> Option<String> {
        self.local.participant_of(session)
    }

    fn join(&self, session: &SessionId, conversation_id: Uuid) -> bool {
        self.local.join(session, conversation_id)
    }

    fn leave(&self, session: &SessionId, conversation_id: Uuid) {
        self.local.leave(session, conversation_id);
    }

    fn is_member(&self, session: &SessionId, conversation_id: Uuid) -> bool {
        self.local.is_member(session, conversation_id)
    }

    fn set_typing(&self, session: &SessionId, conversation_id: Uuid, is_typing: bool) -> bool {
        self.local.set_typing(session, conversation_id, is_typing)
    }

    fn disconnect(&self, session: &SessionId) -> Option<(String, Vec<Uuid>)> {
        self.local.disconnect(session)
    }

    fn publish(&self, envelope: RoomEnvelope) {
        if let Err(mpsc::error::SendError(envelope)) = self.outbound.send(envelope) {
            tracing::warn!("room publisher gone, delivering locally only");
            self.local.deliver(&envelope);
        }
    }

    fn send_to(&self, session: &SessionId, event: ServerEvent) -> bool {
        self.local.send_to(session, event)
    }
}
