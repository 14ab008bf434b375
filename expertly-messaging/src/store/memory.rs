use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use expertly_shared::types::{canonical_pair, Conversation, Message, MessageStatus};

use super::{
    require_participant, validate_pair, ChatStore, CreatedMessage, NewMessage, ReadOutcome,
    StoreError, StoreResult,
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    by_pair: HashMap<(String, String), Uuid>,
    /// Per conversation, in insertion order (which is timestamp order).
    messages: HashMap<Uuid, Vec<Message>>,
}

/// Single-process store. One lock covers every map, so each operation is
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryChatStore {
    inner: Mutex<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unread_in(messages: &[Message], reader_id: &str) -> u32 {
    messages
        .iter()
        .filter(|m| m.receiver_id == reader_id && m.status != MessageStatus::Read)
        .count() as u32
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn find_or_create_conversation(&self, a: &str, b: &str) -> StoreResult<Conversation> {
        validate_pair(a, b)?;
        let key = canonical_pair(a, b);
        let mut inner = self.inner.lock().await;

        if let Some(conversation) = inner.by_pair.get(&key).and_then(|id| inner.conversations.get(id)) {
            return Ok(conversation.clone());
        }

        let now = Utc::now();
        let mut unread_count = BTreeMap::new();
        unread_count.insert(key.0.clone(), 0);
        unread_count.insert(key.1.clone(), 0);
        let conversation = Conversation {
            id: Uuid::now_v7(),
            participant_a: key.0.clone(),
            participant_b: key.1.clone(),
            last_message_id: None,
            last_message_text: String::new(),
            unread_count,
            created_at: now,
            updated_at: now,
        };

        inner.by_pair.insert(key, conversation.id);
        inner.conversations.insert(conversation.id, conversation.clone());
        tracing::debug!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
        let inner = self.inner.lock().await;
        inner.conversations.get(&id).cloned().ok_or(StoreError::NotFound("conversation"))
    }

    async fn list_conversations(&self, participant_id: &str) -> StoreResult<Vec<Conversation>> {
        let inner = self.inner.lock().await;
        let mut list: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(participant_id))
            .cloned()
            .collect();
        list.sort_by(|x, y| y.updated_at.cmp(&x.updated_at).then(y.id.cmp(&x.id)));
        Ok(list)
    }

    async fn unread_total(&self, participant_id: &str) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .values()
            .map(|c| u64::from(c.unread_for(participant_id)))
            .sum())
    }

    async fn create_message(&self, new: NewMessage) -> StoreResult<CreatedMessage> {
        new.validate()?;
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let conversation = inner
            .conversations
            .get_mut(&new.conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        new.check_participants(conversation)?;

        let thread = inner.messages.entry(new.conversation_id).or_default();

        if let Some(key) = new.client_key.as_deref() {
            if let Some(existing) = thread
                .iter()
                .find(|m| m.sender_id == new.sender_id && m.client_key.as_deref() == Some(key))
            {
                return Ok(CreatedMessage {
                    message: existing.clone(),
                    conversation: conversation.clone(),
                    inserted: false,
                });
            }
        }

        // Microsecond precision, as stored by Postgres. Never earlier than the
        // conversation's last activity, so timestamps within a conversation
        // are non-decreasing.
        let timestamp = Utc::now().trunc_subsecs(6).max(conversation.updated_at);
        let message = Message {
            id: Uuid::now_v7(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            payload: new.payload,
            status: MessageStatus::Sent,
            timestamp,
            read_at: None,
            client_key: new.client_key,
        };

        conversation.last_message_id = Some(message.id);
        conversation.last_message_text = message.payload.preview();
        conversation.updated_at = timestamp;
        *conversation
            .unread_count
            .entry(message.receiver_id.clone())
            .or_insert(0) += 1;

        thread.push(message.clone());

        Ok(CreatedMessage {
            message,
            conversation: conversation.clone(),
            inserted: true,
        })
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(StoreError::NotFound("conversation"));
        }
        Ok(inner.messages.get(&conversation_id).cloned().unwrap_or_default())
    }

    async fn list_messages_page(
        &self,
        conversation_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)> {
        let all = self.list_messages(conversation_id).await?;
        let total = all.len() as i64;
        let page = all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<ReadOutcome> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        require_participant(conversation, reader_id)?;

        let now = Utc::now();
        let mut count = 0;
        let thread = inner.messages.entry(conversation_id).or_default();
        for message in thread.iter_mut() {
            if message.receiver_id == reader_id && message.status != MessageStatus::Read {
                message.status = MessageStatus::Read;
                message.read_at = Some(now);
                count += 1;
            }
        }

        conversation
            .unread_count
            .insert(reader_id.to_string(), unread_in(thread.as_slice(), reader_id));

        Ok(ReadOutcome {
            count,
            conversation: conversation.clone(),
        })
    }

    async fn mark_delivered(&self, conversation_id: Uuid, recipient_id: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::NotFound("conversation"))?;
        require_participant(conversation, recipient_id)?;

        let mut count = 0;
        if let Some(thread) = inner.messages.get_mut(&conversation_id) {
            for message in thread.iter_mut() {
                if message.receiver_id == recipient_id && message.status == MessageStatus::Sent {
                    message.status = message.status.advance(MessageStatus::Delivered);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Timelike;

    use expertly_shared::types::MessagePayload;

    use super::*;

    fn text(conversation: &Conversation, from: &str, body: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation.id,
            sender_id: from.into(),
            receiver_id: conversation.other_participant(from).unwrap().into(),
            payload: MessagePayload::text(body),
            client_key: None,
        }
    }

    #[tokio::test]
    async fn pair_order_does_not_matter() {
        let store = MemoryChatStore::new();
        let first = store.find_or_create_conversation("expert-9", "client-1").await.unwrap();
        let second = store.find_or_create_conversation("client-1", "expert-9").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.participant_a, "client-1");
        assert_eq!(store.list_conversations("client-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_conversation() {
        let store = Arc::new(MemoryChatStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 { ("c1", "e1") } else { ("e1", "c1") };
                store.find_or_create_conversation(a, b).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_keep_every_unread_increment() {
        let store = Arc::new(MemoryChatStore::new());
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let new = text(&conversation, "c1", &format!("m{i}"));
            handles.push(tokio::spawn(async move { store.create_message(new).await.unwrap() }));
        }
        for h in handles {
            assert!(h.await.unwrap().inserted);
        }

        let conversation = store.get_conversation(conversation.id).await.unwrap();
        assert_eq!(conversation.unread_for("e1"), 50);
        assert_eq!(conversation.unread_for("c1"), 0);
        assert_eq!(store.list_messages(conversation.id).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn timestamps_have_storage_precision() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        let created = store.create_message(text(&conversation, "c1", "hi")).await.unwrap();

        assert_eq!(created.message.timestamp.nanosecond() % 1_000, 0);
        let listed = store.list_messages(conversation.id).await.unwrap();
        assert_eq!(listed[0].timestamp, created.message.timestamp);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let store = MemoryChatStore::new();
        let err = store.find_or_create_conversation("c1", "c1").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn create_updates_summary_and_receiver_counter() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();

        let created = store.create_message(text(&conversation, "c1", "hello")).await.unwrap();
        assert!(created.inserted);
        assert_eq!(created.message.status, MessageStatus::Sent);
        assert_eq!(created.conversation.last_message_id, Some(created.message.id));
        assert_eq!(created.conversation.last_message_text, "hello");
        assert_eq!(created.conversation.updated_at, created.message.timestamp);
        assert_eq!(created.conversation.unread_for("e1"), 1);
        assert_eq!(created.conversation.unread_for("c1"), 0);
    }

    #[tokio::test]
    async fn timestamps_never_decrease() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        for i in 0..20 {
            let from = if i % 3 == 0 { "e1" } else { "c1" };
            store.create_message(text(&conversation, from, &format!("m{i}"))).await.unwrap();
        }
        let messages = store.list_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 20);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = MemoryChatStore::new();
        let err = store
            .create_message(NewMessage {
                conversation_id: Uuid::now_v7(),
                sender_id: "c1".into(),
                receiver_id: "e1".into(),
                payload: MessagePayload::text("hi"),
                client_key: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("conversation")));
        assert!(matches!(
            store.mark_read(Uuid::now_v7(), "c1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn outsider_cannot_post() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        let err = store
            .create_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: "c2".into(),
                receiver_id: "e1".into(),
                payload: MessagePayload::text("hi"),
                client_key: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(store.list_messages(conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_key_makes_create_idempotent() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        let mut draft = text(&conversation, "c1", "once");
        draft.client_key = Some("key-1".into());

        let first = store.create_message(draft.clone()).await.unwrap();
        let again = store.create_message(draft).await.unwrap();
        assert!(!again.inserted);
        assert_eq!(again.message.id, first.message.id);
        assert_eq!(again.conversation.unread_for("e1"), 1);
        assert_eq!(store.list_messages(conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_read_resets_counter_without_reordering() {
        let store = MemoryChatStore::new();
        let older = store.find_or_create_conversation("c1", "e1").await.unwrap();
        let newer = store.find_or_create_conversation("c1", "e2").await.unwrap();
        store.create_message(text(&older, "e1", "one")).await.unwrap();
        store.create_message(text(&older, "e1", "two")).await.unwrap();
        store.create_message(text(&older, "c1", "mine")).await.unwrap();
        store.create_message(text(&newer, "e2", "three")).await.unwrap();

        assert_eq!(store.unread_total("c1").await.unwrap(), 3);
        let before = store.get_conversation(older.id).await.unwrap().updated_at;

        let outcome = store.mark_read(older.id, "c1").await.unwrap();
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.conversation.unread_for("c1"), 0);
        assert_eq!(outcome.conversation.unread_for("e1"), 1);
        assert_eq!(outcome.conversation.updated_at, before);

        let list = store.list_conversations("c1").await.unwrap();
        assert_eq!(list[0].id, newer.id);
        assert_eq!(store.unread_total("c1").await.unwrap(), 1);

        let messages = store.list_messages(older.id).await.unwrap();
        for m in messages.iter().filter(|m| m.receiver_id == "c1") {
            assert_eq!(m.status, MessageStatus::Read);
            assert!(m.read_at.is_some());
        }
        let mine = messages.iter().find(|m| m.sender_id == "c1").unwrap();
        assert_eq!(mine.status, MessageStatus::Sent);

        assert_eq!(store.mark_read(older.id, "c1").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn delivered_never_downgrades_read() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        store.create_message(text(&conversation, "c1", "a")).await.unwrap();
        store.mark_read(conversation.id, "e1").await.unwrap();
        store.create_message(text(&conversation, "c1", "b")).await.unwrap();

        assert_eq!(store.mark_delivered(conversation.id, "e1").await.unwrap(), 1);
        let statuses: Vec<_> = store
            .list_messages(conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.status)
            .collect();
        assert_eq!(statuses, vec![MessageStatus::Read, MessageStatus::Delivered]);
        assert_eq!(store.get_conversation(conversation.id).await.unwrap().unread_for("e1"), 1);
    }

    #[tokio::test]
    async fn pages_are_windows_of_the_full_list() {
        let store = MemoryChatStore::new();
        let conversation = store.find_or_create_conversation("c1", "e1").await.unwrap();
        for i in 0..5 {
            store.create_message(text(&conversation, "c1", &format!("m{i}"))).await.unwrap();
        }
        let (page, total) = store.list_messages_page(conversation.id, 2, 2).await.unwrap();
        assert_eq!(total, 5);
        let bodies: Vec<_> = page.iter().filter_map(|m| m.payload.text_body()).collect();
        assert_eq!(bodies, vec!["m2", "m3"]);
    }
}
