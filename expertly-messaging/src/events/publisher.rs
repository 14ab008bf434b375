use async_trait::async_trait;
use uuid::Uuid;

use expertly_shared::clients::rabbitmq::RabbitMQClient;
use expertly_shared::types::event::{payloads, routing_keys, Event};
use expertly_shared::types::Message;

const SOURCE: &str = "expertly-messaging";

/// Outbound domain events for other services (notifications, analytics).
/// Publishing is best effort: failures are logged, never surfaced to the
/// caller whose message is already persisted.
#[async_trait]
pub trait DomainEvents: Send + Sync {
    async fn message_sent(&self, message: &Message);
    async fn messages_read(&self, conversation_id: Uuid, reader_id: &str, count: u64);
}

pub struct RabbitPublisher {
    rabbitmq: RabbitMQClient,
}

impl RabbitPublisher {
    pub fn new(rabbitmq: RabbitMQClient) -> Self {
        Self { rabbitmq }
    }
}

#[async_trait]
impl DomainEvents for RabbitPublisher {
    async fn message_sent(&self, message: &Message) {
        let event = Event::new(
            SOURCE,
            routing_keys::MESSAGING_MESSAGE_SENT,
            payloads::MessageSent {
                message_id: message.id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id.clone(),
                receiver_id: message.receiver_id.clone(),
                message_type: message.payload.kind().to_string(),
                content_preview: message.payload.preview(),
            },
        )
        .with_user(message.sender_id.as_str())
        .with_correlation(message.conversation_id);

        if let Err(e) = self.rabbitmq.publish(routing_keys::MESSAGING_MESSAGE_SENT, &event).await {
            tracing::error!(error = %e, message_id = %message.id, "failed to publish message.sent event");
        }
    }

    async fn messages_read(&self, conversation_id: Uuid, reader_id: &str, count: u64) {
        let event = Event::new(
            SOURCE,
            routing_keys::MESSAGING_MESSAGES_READ,
            payloads::MessagesRead {
                conversation_id,
                reader_id: reader_id.to_string(),
                count,
            },
        )
        .with_user(reader_id)
        .with_correlation(conversation_id);

        if let Err(e) = self.rabbitmq.publish(routing_keys::MESSAGING_MESSAGES_READ, &event).await {
            tracing::error!(error = %e, conversation_id = %conversation_id, "failed to publish messages.read event");
        }
    }
}

/// Used when no broker is configured.
pub struct NoopEvents;

#[async_trait]
impl DomainEvents for NoopEvents {
    async fn message_sent(&self, message: &Message) {
        tracing::trace!(message_id = %message.id, "no broker configured, skipping message.sent");
    }

    async fn messages_read(&self, conversation_id: Uuid, _reader_id: &str, _count: u64) {
        tracing::trace!(conversation_id = %conversation_id, "no broker configured, skipping messages.read");
    }
}
