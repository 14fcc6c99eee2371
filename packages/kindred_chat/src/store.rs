//! Conversation/Message Store
//!
//! Client-side cache of the chat list and open threads. State changes come
//! from three places:
//!
//! - explicit fetches (`load_conversations`, `load_messages`)
//! - inbound push (`on_inbound_message`, `on_message_updated`,
//!   `on_conversation_changed`)
//! - local actions (`mark_read`, `activate` / `deactivate`)
//!
//! Sending never appends locally. The sender's own message arrives through
//! the same push path as everyone else's, so there is exactly one code path
//! that adds messages and no optimistic copy to reconcile.
//!
//! Fetch failures never escape: they degrade to an empty result and set
//! [`ConversationStore::last_error`].

use futures::future::join_all;
use kindred_realtime::RowChange;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::models::{
    Conversation, ConversationId, ConversationSummary, MatchId, Message, MessageId, NewMessage,
    ProfileSummary, UserId,
};
use crate::repository::ChatRepository;
use crate::thread::{ThreadEvent, ThreadPhase, reduce};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Messages fetched when a thread opens
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Reject empty or whitespace-only message content.
pub fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message content is empty".into()));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct StoreState {
    /// Chat list, newest activity first
    conversations: Vec<ConversationSummary>,
    /// Cached threads in arrival order
    messages: HashMap<ConversationId, Vec<Message>>,
    unread: HashMap<ConversationId, usize>,
    active: Option<ConversationId>,
    /// Bumped whenever the active conversation changes; fetches started
    /// under an older generation are not applied.
    generation: u64,
    threads: HashMap<ConversationId, ThreadPhase>,
    last_error: Option<ChatError>,
}

impl StoreState {
    fn summary_mut(&mut self, id: ConversationId) -> Option<&mut ConversationSummary> {
        self.conversations.iter_mut().find(|s| s.id() == id)
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    }

    /// Unread counterpart messages among the cached ones
    fn cached_unread(&self, conversation: ConversationId, me: UserId) -> usize {
        self.messages
            .get(&conversation)
            .map(|thread| {
                thread
                    .iter()
                    .filter(|m| m.sender_id != me && !m.is_read)
                    .count()
            })
            .unwrap_or(0)
    }
}

pub struct ConversationStore {
    me: UserId,
    repo: ChatRepository,
    config: StoreConfig,
    state: RwLock<StoreState>,
}

impl ConversationStore {
    pub fn new(me: UserId, repo: ChatRepository, config: StoreConfig) -> Self {
        Self {
            me,
            repo,
            config,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.me
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    /// Fetch the chat list and enrich every entry.
    ///
    /// Profile, latest message and unread count are looked up concurrently
    /// and independently. A failed lookup degrades that one field: the
    /// profile becomes a placeholder, the latest message is left out, and the
    /// unread count falls back to what the cache knows.
    pub async fn load_conversations(&self) -> Vec<ConversationSummary> {
        let conversations = match self.repo.conversations_for(self.me).await {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!("Failed to load conversations for {}: {}", self.me, e);
                let mut state = self.state.write().await;
                state.conversations.clear();
                state.last_error = Some(e.into());
                return Vec::new();
            }
        };

        let lookups = conversations.into_iter().map(|conversation| self.enrich(conversation));
        let enriched: Vec<(ConversationSummary, Option<usize>)> = join_all(lookups).await;

        let mut state = self.state.write().await;
        let mut summaries = Vec::with_capacity(enriched.len());
        for (mut summary, fetched_unread) in enriched {
            let id = summary.id();
            // The open thread is read as messages arrive; a count fetched
            // before that write landed would resurrect them.
            let unread = match fetched_unread {
                Some(fetched) if state.active != Some(id) => fetched,
                _ => state.cached_unread(id, self.me),
            };
            summary.unread_count = unread;
            state.unread.insert(id, unread);
            summaries.push(summary);
        }
        state.conversations = summaries;
        state.sort_conversations();
        state.last_error = None;
        debug!(
            "Loaded {} conversation(s) for {}",
            state.conversations.len(),
            self.me
        );
        state.conversations.clone()
    }

    async fn enrich(&self, conversation: Conversation) -> (ConversationSummary, Option<usize>) {
        let counterpart = conversation.counterpart(self.me);
        let (profile, latest, unread) = futures::join!(
            self.repo.profile(counterpart),
            self.repo.latest_message(conversation.id),
            self.repo.unread_count(conversation.id, counterpart),
        );

        let counterpart = profile.unwrap_or_else(|e| {
            debug!("Profile lookup for {} failed: {}", counterpart, e);
            ProfileSummary::placeholder(counterpart)
        });
        let last_message = latest.unwrap_or_else(|e| {
            debug!("Latest message lookup for {} failed: {}", conversation.id, e);
            None
        });
        let unread = unread
            .map_err(|e| debug!("Unread count for {} failed: {}", conversation.id, e))
            .ok();

        (
            ConversationSummary {
                conversation,
                counterpart,
                last_message,
                unread_count: 0,
            },
            unread,
        )
    }

    /// Fetch the newest page of a thread, oldest to newest.
    ///
    /// The page is merged into the cache unless the active conversation
    /// changed while it was in flight; in that case it is only returned.
    pub async fn load_messages(&self, conversation: ConversationId) -> Vec<Message> {
        let generation = self.state.read().await.generation;

        let page = match self.repo.messages_page(conversation, self.config.page_size).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to load messages for {}: {}", conversation, e);
                self.state.write().await.last_error = Some(e.into());
                return Vec::new();
            }
        };

        self.apply_page(conversation, generation, &page).await;
        page
    }

    /// Merge a fetched page into the cache if `generation` is still current.
    async fn apply_page(
        &self,
        conversation: ConversationId,
        generation: u64,
        page: &[Message],
    ) -> bool {
        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(
                "Dropping stale page for {} (generation {} -> {})",
                conversation, generation, state.generation
            );
            return false;
        }

        let thread = state.messages.entry(conversation).or_default();
        for message in page {
            match thread.iter_mut().find(|m| m.id == message.id) {
                // Read flags only move forward
                Some(cached) => cached.is_read |= message.is_read,
                None => thread.push(message.clone()),
            }
        }
        thread.sort_by_key(|m| m.created_at);
        true
    }

    // =========================================================================
    // Local actions
    // =========================================================================

    /// Write a message. The new row is NOT added to the cache here; it
    /// arrives through [`Self::on_inbound_message`] like any other.
    pub async fn send_message(
        &self,
        conversation: ConversationId,
        content: &str,
    ) -> Result<MessageId, ChatError> {
        validate_content(content)?;

        let new_message = NewMessage {
            conversation_id: conversation,
            sender_id: self.me,
            content: content.to_string(),
        };
        match self.repo.insert_message(&new_message).await {
            Ok(stored) => {
                debug!("Sent message {} in {}", stored.id, conversation);
                Ok(stored.id)
            }
            Err(e) => {
                warn!("Failed to send message in {}: {}", conversation, e);
                let err = ChatError::from(e);
                self.state.write().await.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Mark every counterpart message in `conversation` as read.
    ///
    /// The cache is updated first and stays read even if the backend write
    /// fails. Repeated calls are harmless.
    pub async fn mark_read(&self, conversation: ConversationId) -> Result<(), ChatError> {
        let (marked, counterpart) = {
            let mut state = self.state.write().await;
            let me = self.me;
            let mut marked = 0;
            if let Some(thread) = state.messages.get_mut(&conversation) {
                for message in thread.iter_mut().filter(|m| m.sender_id != me && !m.is_read) {
                    message.is_read = true;
                    marked += 1;
                }
            }
            state.unread.insert(conversation, 0);
            let counterpart = state.summary_mut(conversation).map(|summary| {
                summary.unread_count = 0;
                if let Some(last) = summary.last_message.as_mut() {
                    if last.sender_id != me {
                        last.is_read = true;
                    }
                }
                summary.conversation.counterpart(me)
            });
            (marked, counterpart)
        };

        let counterpart = match counterpart {
            Some(counterpart) => counterpart,
            None => match self.repo.conversation(conversation).await {
                Ok(Some(found)) => found.counterpart(self.me),
                Ok(None) => {
                    debug!("mark_read on unknown conversation {}", conversation);
                    return Ok(());
                }
                Err(e) => return Err(self.record(e.into()).await),
            },
        };

        match self.repo.mark_read(conversation, counterpart).await {
            Ok(updated) => {
                if marked > 0 || updated > 0 {
                    debug!(
                        "Marked {} cached / {} stored message(s) read in {}",
                        marked, updated, conversation
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to persist read state for {}: {}", conversation, e);
                Err(self.record(e.into()).await)
            }
        }
    }

    /// Resolve (creating on first touch) the conversation for a match.
    pub async fn conversation_for_match(
        &self,
        match_id: MatchId,
    ) -> Result<ConversationId, ChatError> {
        match self.repo.conversation_from_match(match_id).await {
            Ok(id) => {
                info!("Conversation {} ready for match {}", id, match_id);
                Ok(id)
            }
            Err(e) => {
                warn!("Failed to open conversation for match {}: {}", match_id, e);
                Err(self.record(e.into()).await)
            }
        }
    }

    async fn record(&self, err: ChatError) -> ChatError {
        self.state.write().await.last_error = Some(err.clone());
        err
    }

    // =========================================================================
    // Inbound push
    // =========================================================================

    /// Append a pushed message. Returns false for a duplicate delivery.
    ///
    /// A counterpart message in the active conversation is marked read right
    /// away; anywhere else it counts as unread.
    pub async fn on_inbound_message(&self, message: Message) -> bool {
        let conversation = message.conversation_id;
        let from_counterpart = message.sender_id != self.me;

        let read_now = {
            let mut state = self.state.write().await;
            let thread = state.messages.entry(conversation).or_default();
            if thread.iter().any(|m| m.id == message.id) {
                debug!("Ignoring duplicate message {}", message.id);
                return false;
            }
            thread.push(message.clone());

            let active = state.active == Some(conversation);
            let unread = if from_counterpart && !message.is_read && !active {
                let count = state.unread.entry(conversation).or_insert(0);
                *count += 1;
                Some(*count)
            } else {
                None
            };

            if let Some(summary) = state.summary_mut(conversation) {
                summary.conversation.last_message_id = Some(message.id);
                summary.conversation.last_message_at = Some(message.created_at);
                summary.last_message = Some(message.clone());
                if let Some(unread) = unread {
                    summary.unread_count = unread;
                }
            }
            state.sort_conversations();

            from_counterpart && !message.is_read && active
        };

        if read_now {
            if let Err(e) = self.mark_read(conversation).await {
                debug!("Mark-read after inbound message failed: {}", e);
            }
        }
        true
    }

    /// Apply a pushed row update. Only the `is_read` false -> true transition
    /// is honoured; message content is immutable.
    pub async fn on_message_updated(&self, message: Message) -> bool {
        if !message.is_read {
            return false;
        }
        let conversation = message.conversation_id;
        let me = self.me;
        let mut state = self.state.write().await;

        let newly_read = state
            .messages
            .get_mut(&conversation)
            .and_then(|thread| thread.iter_mut().find(|m| m.id == message.id))
            .filter(|cached| !cached.is_read)
            .map(|cached| {
                cached.is_read = true;
                cached.sender_id != me
            });
        let Some(counts_as_unread) = newly_read else {
            return false;
        };

        let mut remaining = None;
        if counts_as_unread {
            if let Some(count) = state.unread.get_mut(&conversation) {
                *count = count.saturating_sub(1);
                remaining = Some(*count);
            }
        }
        if let Some(summary) = state.summary_mut(conversation) {
            if let Some(unread) = remaining {
                summary.unread_count = unread;
            }
            if let Some(last) = summary.last_message.as_mut().filter(|m| m.id == message.id) {
                last.is_read = true;
            }
        }
        true
    }

    /// Any change to one of our conversations triggers a full list refresh.
    pub async fn on_conversation_changed(&self, change: &RowChange) -> Vec<ConversationSummary> {
        debug!(
            "Conversation row {:?} on {}; refreshing list",
            change.kind, change.table
        );
        self.load_conversations().await
    }

    // =========================================================================
    // Active thread + lifecycle
    // =========================================================================

    /// Make `conversation` the one open in the UI. Returns the new generation.
    pub async fn activate(&self, conversation: ConversationId) -> u64 {
        let mut state = self.state.write().await;
        state.active = Some(conversation);
        state.generation += 1;
        let phase = state.threads.entry(conversation).or_default();
        *phase = reduce(*phase, ThreadEvent::Open);
        state.generation
    }

    /// Close `conversation` in the UI. Returns false if it was not active.
    pub async fn deactivate(&self, conversation: ConversationId) -> bool {
        let mut state = self.state.write().await;
        if state.active != Some(conversation) {
            return false;
        }
        state.active = None;
        state.generation += 1;
        true
    }

    /// Feed a lifecycle event into the thread reducer.
    pub async fn apply_thread_event(
        &self,
        conversation: ConversationId,
        event: ThreadEvent,
    ) -> ThreadPhase {
        let mut state = self.state.write().await;
        let phase = state.threads.entry(conversation).or_default();
        let next = reduce(*phase, event);
        if next != *phase {
            debug!("Thread {}: {:?} -> {:?} on {:?}", conversation, *phase, next, event);
        }
        *phase = next;
        next
    }

    pub async fn thread_phase(&self, conversation: ConversationId) -> ThreadPhase {
        self.state
            .read()
            .await
            .threads
            .get(&conversation)
            .copied()
            .unwrap_or_default()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.state.read().await.conversations.clone()
    }

    pub async fn conversation(&self, id: ConversationId) -> Option<ConversationSummary> {
        self.state
            .read()
            .await
            .conversations
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub async fn messages(&self, conversation: ConversationId) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn unread_count(&self, conversation: ConversationId) -> usize {
        self.state
            .read()
            .await
            .unread
            .get(&conversation)
            .copied()
            .unwrap_or(0)
    }

    /// Unread messages across every conversation (notification badge)
    pub async fn total_unread(&self) -> usize {
        self.state.read().await.unread.values().sum()
    }

    pub async fn last_error(&self) -> Option<ChatError> {
        self.state.read().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.state.write().await.last_error = None;
    }

    pub async fn is_active(&self, conversation: ConversationId) -> bool {
        self.state.read().await.active == Some(conversation)
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.state.read().await.active
    }

    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }
}
