//! Inbound typing indicators, last-write-wins per (conversation, user).
//!
//! A "typing" signal whose stop never arrives (the sender closed the tab)
//! expires after `stale_after`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::models::{ConversationId, TypingIndicator, UserId};

pub const DEFAULT_TYPING_STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct TypingRegistry {
    entries: HashMap<(ConversationId, UserId), TypingIndicator>,
    stale_after: Duration,
}

impl Default for TypingRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_STALE_AFTER)
    }
}

impl TypingRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            stale_after,
        }
    }

    /// Record an indicator unless a newer one is already held.
    /// Returns true if it was applied.
    pub fn apply(&mut self, indicator: TypingIndicator) -> bool {
        let key = (indicator.conversation_id, indicator.user_id);
        match self.entries.get(&key) {
            Some(current) if current.updated_at > indicator.updated_at => false,
            _ => {
                self.entries.insert(key, indicator);
                true
            }
        }
    }

    fn is_fresh(&self, indicator: &TypingIndicator, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(indicator.updated_at);
        indicator.is_typing && age.to_std().map_or(true, |age| age < self.stale_after)
    }

    pub fn is_typing(
        &self,
        conversation: ConversationId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> bool {
        self.entries
            .get(&(conversation, user))
            .is_some_and(|i| self.is_fresh(i, now))
    }

    /// Users currently typing in `conversation`, sorted
    pub fn typing_users(&self, conversation: ConversationId, now: DateTime<Utc>) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .values()
            .filter(|i| i.conversation_id == conversation && self.is_fresh(i, now))
            .map(|i| i.user_id)
            .collect();
        users.sort();
        users
    }

    /// Drop indicators older than the stale window. Returns how many were
    /// removed.
    ///
    /// Recent stops are kept: they still have to win against a late "typing"
    /// with an older timestamp.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let stale_after = self.stale_after;
        self.entries.retain(|_, i| {
            let age = now.signed_duration_since(i.updated_at);
            age.to_std().map_or(true, |age| age < stale_after)
        });
        before - self.entries.len()
    }

    pub fn clear_conversation(&mut self, conversation: ConversationId) {
        self.entries.retain(|(c, _), _| *c != conversation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
