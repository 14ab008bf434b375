use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use diesel::prelude::*;
use diesel::pg::PgConnection;
use uuid::Uuid;

use expertly_shared::clients::db::DbPool;
use expertly_shared::types::{canonical_pair, Conversation, Message, MessageStatus};

use crate::models::{ConversationRow, MessageRow, NewConversationRow};
use crate::schema::{conversations, messages};

use super::{
    require_participant, validate_pair, ChatStore, CreatedMessage, NewMessage, ReadOutcome,
    StoreError, StoreResult,
};

/// Diesel-backed store. Queries run on the blocking pool; writes that span
/// both tables lock the conversation row first.
#[derive(Clone)]
pub struct PgChatStore {
    pool: DbPool,
}

impl PgChatStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Persistence(format!("connection pool: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Persistence(format!("store task failed: {e}")))?
    }
}

fn to_message(row: MessageRow) -> StoreResult<Message> {
    Message::try_from(row).map_err(StoreError::Persistence)
}

fn load_conversation(conn: &mut PgConnection, id: Uuid) -> StoreResult<ConversationRow> {
    conversations::table
        .find(id)
        .select(ConversationRow::as_select())
        .first(conn)
        .optional()?
        .ok_or(StoreError::NotFound("conversation"))
}

/// Same as `load_conversation`, holding a row lock until the transaction ends.
fn lock_conversation(conn: &mut PgConnection, id: Uuid) -> StoreResult<ConversationRow> {
    conversations::table
        .find(id)
        .select(ConversationRow::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(StoreError::NotFound("conversation"))
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn find_or_create_conversation(&self, a: &str, b: &str) -> StoreResult<Conversation> {
        validate_pair(a, b)?;
        let (first, second) = canonical_pair(a, b);

        self.run(move |conn| {
            let inserted = diesel::insert_into(conversations::table)
                .values(&NewConversationRow {
                    id: Uuid::now_v7(),
                    participant_a: &first,
                    participant_b: &second,
                })
                .on_conflict((conversations::participant_a, conversations::participant_b))
                .do_nothing()
                .execute(conn)?;
            if inserted > 0 {
                tracing::debug!(participant_a = %first, participant_b = %second, "conversation created");
            }

            let row = conversations::table
                .filter(conversations::participant_a.eq(&first))
                .filter(conversations::participant_b.eq(&second))
                .select(ConversationRow::as_select())
                .first(conn)?;
            Ok(row.into())
        })
        .await
    }

    async fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
        self.run(move |conn| Ok(load_conversation(conn, id)?.into())).await
    }

    async fn list_conversations(&self, participant_id: &str) -> StoreResult<Vec<Conversation>> {
        let participant_id = participant_id.to_string();
        self.run(move |conn| {
            let rows = conversations::table
                .filter(
                    conversations::participant_a
                        .eq(&participant_id)
                        .or(conversations::participant_b.eq(&participant_id)),
                )
                .order((conversations::updated_at.desc(), conversations::id.desc()))
                .select(ConversationRow::as_select())
                .load(conn)?;
            Ok(rows.into_iter().map(Conversation::from).collect())
        })
        .await
    }

    async fn unread_total(&self, participant_id: &str) -> StoreResult<u64> {
        let participant_id = participant_id.to_string();
        self.run(move |conn| {
            let as_a: Option<i64> = conversations::table
                .filter(conversations::participant_a.eq(&participant_id))
                .select(diesel::dsl::sum(conversations::unread_a))
                .first(conn)?;
            let as_b: Option<i64> = conversations::table
                .filter(conversations::participant_b.eq(&participant_id))
                .select(diesel::dsl::sum(conversations::unread_b))
                .first(conn)?;
            Ok((as_a.unwrap_or(0) + as_b.unwrap_or(0)).max(0) as u64)
        })
        .await
    }

    async fn create_message(&self, new: NewMessage) -> StoreResult<CreatedMessage> {
        new.validate()?;

        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let locked = lock_conversation(conn, new.conversation_id)?;
                let conversation = Conversation::from(locked.clone());
                new.check_participants(&conversation)?;

                // The row lock serializes creates per conversation, so this
                // lookup cannot race a concurrent insert with the same key.
                if let Some(key) = new.client_key.as_deref() {
                    let existing = messages::table
                        .filter(messages::conversation_id.eq(new.conversation_id))
                        .filter(messages::sender_id.eq(&new.sender_id))
                        .filter(messages::client_key.eq(key))
                        .select(MessageRow::as_select())
                        .first(conn)
                        .optional()?;
                    if let Some(row) = existing {
                        return Ok(CreatedMessage {
                            message: to_message(row)?,
                            conversation,
                            inserted: false,
                        });
                    }
                }

                let timestamp = Utc::now().trunc_subsecs(6).max(locked.updated_at);
                let message = Message {
                    id: Uuid::now_v7(),
                    conversation_id: new.conversation_id,
                    sender_id: new.sender_id.clone(),
                    receiver_id: new.receiver_id.clone(),
                    payload: new.payload.clone(),
                    status: MessageStatus::Sent,
                    timestamp,
                    read_at: None,
                    client_key: new.client_key.clone(),
                };

                let row = MessageRow::from_message(&message).map_err(StoreError::Validation)?;
                diesel::insert_into(messages::table).values(&row).execute(conn)?;

                let target = conversations::table.find(new.conversation_id);
                let preview = message.payload.preview();
                let updated = if message.receiver_id == locked.participant_a {
                    diesel::update(target)
                        .set((
                            conversations::unread_a.eq(conversations::unread_a + 1),
                            conversations::last_message_id.eq(Some(message.id)),
                            conversations::last_message_text.eq(&preview),
                            conversations::updated_at.eq(timestamp),
                        ))
                        .returning(ConversationRow::as_returning())
                        .get_result(conn)?
                } else {
                    diesel::update(target)
                        .set((
                            conversations::unread_b.eq(conversations::unread_b + 1),
                            conversations::last_message_id.eq(Some(message.id)),
                            conversations::last_message_text.eq(&preview),
                            conversations::updated_at.eq(timestamp),
                        ))
                        .returning(ConversationRow::as_returning())
                        .get_result(conn)?
                };

                Ok(CreatedMessage {
                    message,
                    conversation: updated.into(),
                    inserted: true,
                })
            })
        })
        .await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        self.run(move |conn| {
            load_conversation(conn, conversation_id)?;
            let rows = messages::table
                .filter(messages::conversation_id.eq(conversation_id))
                .order((messages::created_at.asc(), messages::id.asc()))
                .select(MessageRow::as_select())
                .load(conn)?;
            rows.into_iter().map(to_message).collect()
        })
        .await
    }

    async fn list_messages_page(
        &self,
        conversation_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<Message>, i64)> {
        self.run(move |conn| {
            load_conversation(conn, conversation_id)?;
            let total: i64 = messages::table
                .filter(messages::conversation_id.eq(conversation_id))
                .count()
                .get_result(conn)?;
            let rows = messages::table
                .filter(messages::conversation_id.eq(conversation_id))
                .order((messages::created_at.asc(), messages::id.asc()))
                .offset(offset.max(0))
                .limit(limit.max(0))
                .select(MessageRow::as_select())
                .load(conn)?;
            let page = rows.into_iter().map(to_message).collect::<StoreResult<Vec<_>>>()?;
            Ok((page, total))
        })
        .await
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<ReadOutcome> {
        let reader_id = reader_id.to_string();
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let locked = lock_conversation(conn, conversation_id)?;
                require_participant(&Conversation::from(locked.clone()), &reader_id)?;

                let unread = messages::table
                    .filter(messages::conversation_id.eq(conversation_id))
                    .filter(messages::receiver_id.eq(&reader_id))
                    .filter(messages::status.ne(MessageStatus::Read.as_str()));

                let count = diesel::update(unread.clone())
                    .set((
                        messages::status.eq(MessageStatus::Read.as_str()),
                        messages::read_at.eq(Some(Utc::now())),
                    ))
                    .execute(conn)?;

                // Recount rather than decrement so a drifted counter heals.
                let remaining: i64 = unread.count().get_result(conn)?;
                let remaining = remaining as i32;

                let target = conversations::table.find(conversation_id);
                let updated = if reader_id == locked.participant_a {
                    diesel::update(target)
                        .set(conversations::unread_a.eq(remaining))
                        .returning(ConversationRow::as_returning())
                        .get_result(conn)?
                } else {
                    diesel::update(target)
                        .set(conversations::unread_b.eq(remaining))
                        .returning(ConversationRow::as_returning())
                        .get_result(conn)?
                };

                Ok(ReadOutcome {
                    count: count as u64,
                    conversation: updated.into(),
                })
            })
        })
        .await
    }

    async fn mark_delivered(&self, conversation_id: Uuid, recipient_id: &str) -> StoreResult<u64> {
        let recipient_id = recipient_id.to_string();
        self.run(move |conn| {
            let conversation = Conversation::from(load_conversation(conn, conversation_id)?);
            require_participant(&conversation, &recipient_id)?;

            let count = diesel::update(
                messages::table
                    .filter(messages::conversation_id.eq(conversation_id))
                    .filter(messages::receiver_id.eq(&recipient_id))
                    .filter(messages::status.eq(MessageStatus::Sent.as_str())),
            )
            .set(messages::status.eq(MessageStatus::Delivered.as_str()))
            .execute(conn)?;
            Ok(count as u64)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }
}
