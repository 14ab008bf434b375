use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use expertly_shared::types::TypingState;

/// Local input idle time after which typing is reported as stopped.
pub const TYPING_IDLE: Duration = Duration::from_secs(2);
/// A remote "typing" indicator without a refresh is dropped after this.
pub const REMOTE_TYPING_TTL: Duration = Duration::from_secs(5);
/// While input continues, "typing" is re-sent this often so the remote
/// indicator does not expire.
pub const TYPING_REFRESH: Duration = Duration::from_secs(3);

/// Debounces local keystrokes into typing start/stop signals.
///
/// `on_input` and `poll` return `Some(is_typing)` when a signal should be
/// sent, `None` otherwise.
#[derive(Debug, Default)]
pub struct TypingTracker {
    last_input: Option<Instant>,
    last_sent: Option<Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.last_input.is_some()
    }

    pub fn on_input(&mut self, now: Instant) -> Option<bool> {
        self.last_input = Some(now);
        match self.last_sent {
            Some(sent) if now.duration_since(sent) < TYPING_REFRESH => None,
            _ => {
                self.last_sent = Some(now);
                Some(true)
            }
        }
    }

    /// Call periodically; reports stop once input has been idle long enough.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let last = self.last_input?;
        if now.duration_since(last) >= TYPING_IDLE {
            self.reset();
            Some(false)
        } else {
            None
        }
    }

    /// Explicit stop, e.g. the message was sent or the view closed.
    pub fn stop(&mut self) -> Option<bool> {
        let was_active = self.is_active();
        self.reset();
        was_active.then_some(false)
    }

    fn reset(&mut self) {
        self.last_input = None;
        self.last_sent = None;
    }
}

/// Who is typing where, as reported by `typing.state` events. Entries expire
/// on their own so a lost "stopped" event cannot leave an indicator stuck.
#[derive(Debug)]
pub struct RemoteTyping {
    ttl: Duration,
    active: HashMap<(Uuid, String), Instant>,
}

impl Default for RemoteTyping {
    fn default() -> Self {
        Self::new(REMOTE_TYPING_TTL)
    }
}

impl RemoteTyping {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, active: HashMap::new() }
    }

    pub fn apply(&mut self, state: &TypingState, now: Instant) {
        let key = (state.conversation_id, state.user_id.clone());
        if state.is_typing {
            self.active.insert(key, now);
        } else {
            self.active.remove(&key);
        }
    }

    /// Users currently typing in `conversation_id`, sorted.
    pub fn typing_in(&self, conversation_id: Uuid, now: Instant) -> Vec<String> {
        let mut users: Vec<String> = self
            .active
            .iter()
            .filter(|((conv, _), seen)| *conv == conversation_id && now.duration_since(**seen) < self.ttl)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.active.retain(|_, seen| now.duration_since(*seen) < ttl);
    }
}
