use uuid::Uuid;

use expertly_shared::types::{Conversation, ServerEvent};

/// Conversation list of one participant, most recently active first.
#[derive(Debug)]
pub struct ConversationList {
    self_id: String,
    items: Vec<Conversation>,
}

impl ConversationList {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self { self_id: self_id.into(), items: Vec::new() }
    }

    pub fn items(&self) -> &[Conversation] {
        &self.items
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&Conversation> {
        self.items.iter().find(|c| c.id == conversation_id)
    }

    /// Inserts or replaces a conversation. Older snapshots than the one held
    /// are ignored so out-of-order `conversation.updated` events cannot roll
    /// the preview back.
    pub fn apply(&mut self, conversation: Conversation) {
        if !conversation.has_participant(&self.self_id) {
            return;
        }
        match self.items.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) if existing.updated_at > conversation.updated_at => return,
            Some(existing) => *existing = conversation,
            None => self.items.push(conversation),
        }
        self.items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub fn apply_event(&mut self, event: &ServerEvent) {
        if let ServerEvent::ConversationUpdated(conversation) = event {
            self.apply(conversation.clone());
        }
    }

    pub fn unread_for(&self, conversation_id: Uuid) -> u32 {
        self.get(conversation_id).map_or(0, |c| c.unread_for(&self.self_id))
    }

    pub fn unread_total(&self) -> u32 {
        self.items.iter().map(|c| c.unread_for(&self.self_id)).sum()
    }
}
