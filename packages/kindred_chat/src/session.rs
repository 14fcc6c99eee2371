//! Chat Session
//!
//! Explicit context for one signed-in user. Owns the store, the presence
//! tracker, the subscription registry and per-thread typing debouncers, and
//! wires realtime channels into them:
//!
//! - `conversations:<user>` row changes → full chat-list refresh
//! - `chat:<conversation>` message rows → inbound messages / read receipts
//! - `chat:<conversation>` "typing" broadcasts and typing rows → typing registry
//!
//! `start` / `stop` replace the implicit mount/unmount lifecycle; opening a
//! conversation twice replaces its channel rather than adding one.

use async_trait::async_trait;
use chrono::Utc;
use kindred_realtime::{
    ChangeKind, Channel, ChannelEvent, ChannelSpec, ChannelStatus, Interaction, PresenceTracker,
    RealtimeError, RealtimeTransport, RowFilter, SubscriptionKey, SubscriptionManager,
    TypingDebouncer, TypingSink, spawn_activity_monitor, spawn_typing_debouncer,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Table};
use crate::config::SessionConfig;
use crate::error::ChatError;
use crate::models::{
    ConversationId, ConversationSummary, Message, MessageId, TypingIndicator, UserId,
};
use crate::repository::ChatRepository;
use crate::store::{ConversationStore, validate_content};
use crate::thread::ThreadEvent;
use crate::typing_registry::TypingRegistry;

/// Broadcast event name carrying a [`TypingIndicator`]
pub const TYPING_EVENT: &str = "typing";

pub fn chat_topic(conversation: ConversationId) -> String {
    format!("chat:{}", conversation)
}

pub fn conversations_topic(user: UserId) -> String {
    format!("conversations:{}", user)
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Option<T> {
    serde_json::from_value(value)
        .map_err(|e| warn!("Dropping malformed {} payload: {}", what, e))
        .ok()
}

/// Delivers outbound typing signals: broadcast while the thread's channel is
/// live, otherwise (or if the broadcast fails) an upsert of the typing row.
struct ChatTypingSink {
    conversation: ConversationId,
    user: UserId,
    channel: Arc<dyn Channel>,
    store: Arc<ConversationStore>,
    repo: ChatRepository,
}

#[async_trait]
impl TypingSink for ChatTypingSink {
    async fn send(&self, is_typing: bool) -> Result<(), RealtimeError> {
        let indicator = TypingIndicator::now(self.conversation, self.user, is_typing);

        if self.store.thread_phase(self.conversation).await.is_live() {
            let payload = serde_json::to_value(&indicator)
                .map_err(|e| RealtimeError::SendFailed(e.to_string()))?;
            match self.channel.broadcast(TYPING_EVENT, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("Typing broadcast failed, falling back to row: {}", e),
            }
        }

        self.repo
            .upsert_typing(&indicator)
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }
}

struct OpenThread {
    cancel: CancellationToken,
    debouncer: TypingDebouncer,
}

pub struct ChatSession {
    me: UserId,
    config: SessionConfig,
    transport: Arc<dyn RealtimeTransport>,
    subscriptions: Arc<SubscriptionManager>,
    repo: ChatRepository,
    store: Arc<ConversationStore>,
    presence: Arc<PresenceTracker>,
    typing: Arc<RwLock<TypingRegistry>>,
    threads: Mutex<HashMap<ConversationId, OpenThread>>,
    interactions: Mutex<Option<mpsc::Sender<Interaction>>>,
    /// Cancels the conversation-list pump and activity monitor
    cancel: Mutex<Option<CancellationToken>>,
}

impl ChatSession {
    pub fn new(
        me: UserId,
        config: SessionConfig,
        transport: Arc<dyn RealtimeTransport>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new());
        let repo = ChatRepository::new(backend);
        let store = Arc::new(ConversationStore::new(me, repo.clone(), config.store.clone()));
        let presence = Arc::new(PresenceTracker::new(
            me.to_string(),
            config.presence.clone(),
            transport.clone(),
            subscriptions.clone(),
        ));
        Self {
            me,
            typing: Arc::new(RwLock::new(TypingRegistry::new(config.typing_stale_after))),
            config,
            transport,
            subscriptions,
            repo,
            store,
            presence,
            threads: Mutex::new(HashMap::new()),
            interactions: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.me
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Join presence, watch our conversations and load the chat list.
    ///
    /// On failure nothing started here is left running.
    pub async fn start(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }

        if let Err(e) = self.presence.start().await {
            self.abort_start(&cancel).await;
            return Err(e.into());
        }

        let (tx, rx) = mpsc::channel(64);
        spawn_activity_monitor(
            self.presence.clone(),
            rx,
            self.config.activity.clone(),
            cancel.clone(),
        );
        *self.interactions.lock().await = Some(tx);

        let me = self.me.to_string();
        let conversations = Table::Conversations.as_str();
        let spec = ChannelSpec::new(conversations_topic(self.me))
            .with_rows(RowFilter::table(conversations).eq("participant_a_id", me.as_str()))
            .with_rows(RowFilter::table(conversations).eq("participant_b_id", me.as_str()));
        let transport = self.transport.clone();
        let subscription = match self
            .subscriptions
            .acquire(SubscriptionKey::conversations(self.me), || async move {
                transport.open(spec).await
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to watch conversations for {}: {}", self.me, e);
                self.abort_start(&cancel).await;
                return Err(e.into());
            }
        };
        tokio::spawn(run_conversation_pump(
            subscription.events,
            self.store.clone(),
            cancel,
        ));

        info!("Chat session started for {}", self.me);
        Ok(self.store.load_conversations().await)
    }

    async fn abort_start(&self, cancel: &CancellationToken) {
        cancel.cancel();
        {
            let mut current = self.cancel.lock().await;
            if current.as_ref().is_some_and(|c| c.is_cancelled()) {
                *current = None;
            }
        }
        *self.interactions.lock().await = None;
        self.presence.stop().await;
    }

    /// Close every thread, leave presence and release all channels.
    pub async fn stop(&self) {
        let open: Vec<ConversationId> = self.threads.lock().await.keys().copied().collect();
        for conversation in open {
            self.close_conversation(conversation).await;
        }
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        *self.interactions.lock().await = None;
        self.presence.stop().await;
        let released = self.subscriptions.release_all().await;
        info!(
            "Chat session stopped for {} ({} channel(s) released)",
            self.me, released
        );
    }

    /// Open a thread in the UI: subscribe to its channel, load the newest
    /// page and mark it read. Reopening replaces the previous channel.
    pub async fn open_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, ChatError> {
        let previous = self.threads.lock().await.remove(&conversation);
        if let Some(previous) = previous {
            previous.cancel.cancel();
            if let Err(e) = previous.debouncer.shutdown().await {
                debug!("Previous typing debouncer already gone: {}", e);
            }
            // The old channel goes away in `acquire`; walk the phase back to
            // Idle so this open starts from Subscribing.
            self.store
                .apply_thread_event(conversation, ThreadEvent::Close)
                .await;
            self.store
                .apply_thread_event(conversation, ThreadEvent::Closed)
                .await;
        }

        self.store.activate(conversation).await;

        let topic = conversation.to_string();
        let spec = ChannelSpec::new(chat_topic(conversation))
            .with_rows(
                RowFilter::table(Table::Messages.as_str()).eq("conversation_id", topic.as_str()),
            )
            .with_rows(
                RowFilter::table(Table::TypingIndicators.as_str())
                    .eq("conversation_id", topic.as_str()),
            );
        let transport = self.transport.clone();
        let subscription = match self
            .subscriptions
            .acquire(SubscriptionKey::chat(conversation), || async move {
                transport.open(spec).await
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", conversation, e);
                self.store
                    .apply_thread_event(conversation, ThreadEvent::Failed)
                    .await;
                self.store.deactivate(conversation).await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let sink = Arc::new(ChatTypingSink {
            conversation,
            user: self.me,
            channel: subscription.channel.clone(),
            store: self.store.clone(),
            repo: self.repo.clone(),
        });
        let debouncer = spawn_typing_debouncer(sink, self.config.typing_idle);
        tokio::spawn(run_chat_pump(
            conversation,
            self.me,
            subscription.events,
            self.store.clone(),
            self.typing.clone(),
            cancel.clone(),
        ));
        self.threads
            .lock()
            .await
            .insert(conversation, OpenThread { cancel, debouncer });

        let messages = self.store.load_messages(conversation).await;
        if let Err(e) = self.store.mark_read(conversation).await {
            warn!("Failed to mark {} read on open: {}", conversation, e);
        }
        debug!("Opened conversation {} ({} message(s))", conversation, messages.len());
        Ok(messages)
    }

    /// Close a thread: stop typing, tear down its channel. Returns false if
    /// the thread was not open.
    pub async fn close_conversation(&self, conversation: ConversationId) -> bool {
        let thread = self.threads.lock().await.remove(&conversation);
        let Some(thread) = thread else {
            return false;
        };

        // Final "stopped typing" goes out while the channel is still live
        if let Err(e) = thread.debouncer.shutdown().await {
            debug!("Typing debouncer already gone: {}", e);
        }
        thread.cancel.cancel();

        self.store
            .apply_thread_event(conversation, ThreadEvent::Close)
            .await;
        self.subscriptions
            .release(&SubscriptionKey::chat(conversation))
            .await;
        self.store
            .apply_thread_event(conversation, ThreadEvent::Closed)
            .await;
        self.store.deactivate(conversation).await;
        self.typing.write().await.clear_conversation(conversation);
        debug!("Closed conversation {}", conversation);
        true
    }

    /// Send a message. Typing stops first; the message itself shows up
    /// through the conversation's channel.
    pub async fn send(
        &self,
        conversation: ConversationId,
        content: &str,
    ) -> Result<MessageId, ChatError> {
        validate_content(content)?;
        if let Some(debouncer) = self.debouncer(conversation).await {
            if let Err(e) = debouncer.stop_typing().await {
                debug!("Could not stop typing before send: {}", e);
            }
        }
        self.store.send_message(conversation, content).await
    }

    /// Report a keystroke in an open thread's composer.
    pub async fn keystroke(&self, conversation: ConversationId) -> Result<(), ChatError> {
        let debouncer = self
            .debouncer(conversation)
            .await
            .ok_or_else(|| {
                ChatError::Validation(format!("conversation {} is not open", conversation))
            })?;
        self.interaction(Interaction::Key).await;
        debouncer.keystroke().await?;
        Ok(())
    }

    /// Feed a local user interaction to the activity monitor.
    pub async fn interaction(&self, interaction: Interaction) {
        if let Some(tx) = self.interactions.lock().await.as_ref() {
            if tx.try_send(interaction).is_err() {
                debug!("Activity monitor busy; dropping {:?}", interaction);
            }
        }
    }

    async fn debouncer(&self, conversation: ConversationId) -> Option<TypingDebouncer> {
        self.threads
            .lock()
            .await
            .get(&conversation)
            .map(|t| t.debouncer.clone())
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.presence.is_online(&user.to_string()).await
    }

    pub async fn is_typing(&self, conversation: ConversationId, user: UserId) -> bool {
        self.typing.read().await.is_typing(conversation, user, Utc::now())
    }

    pub async fn typing_users(&self, conversation: ConversationId) -> Vec<UserId> {
        self.typing.read().await.typing_users(conversation, Utc::now())
    }

    pub async fn open_conversations(&self) -> Vec<ConversationId> {
        let mut open: Vec<ConversationId> = self.threads.lock().await.keys().copied().collect();
        open.sort();
        open
    }
}

/// Apply an inbound indicator and drop expired ones
async fn record_typing(typing: &RwLock<TypingRegistry>, indicator: TypingIndicator) {
    let mut registry = typing.write().await;
    registry.apply(indicator);
    let pruned = registry.prune(Utc::now());
    if pruned > 0 {
        debug!("Pruned {} expired typing indicator(s)", pruned);
    }
}

async fn run_conversation_pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    store: Arc<ConversationStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }
        match event {
            ChannelEvent::Row { change } => {
                store.on_conversation_changed(&change).await;
            }
            ChannelEvent::Status {
                status: ChannelStatus::Closed,
            } => break,
            _ => {}
        }
    }
    debug!("Conversation list pump stopped for {}", store.user_id());
}

async fn run_chat_pump(
    conversation: ConversationId,
    me: UserId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    store: Arc<ConversationStore>,
    typing: Arc<RwLock<TypingRegistry>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }

        match event {
            ChannelEvent::Status { status } => {
                let thread_event = match status {
                    ChannelStatus::Subscribed => ThreadEvent::Subscribed,
                    ChannelStatus::Disconnected => ThreadEvent::Disconnected,
                    ChannelStatus::Closed => ThreadEvent::Closed,
                };
                store.apply_thread_event(conversation, thread_event).await;
                if status == ChannelStatus::Closed {
                    break;
                }
            }
            ChannelEvent::Row { change } => {
                let table = change.table.as_str();
                if table == Table::Messages.as_str() {
                    let Some(message) = decode::<Message>(change.record, "message") else {
                        continue;
                    };
                    match change.kind {
                        ChangeKind::Insert => {
                            store.on_inbound_message(message).await;
                        }
                        ChangeKind::Update => {
                            store.on_message_updated(message).await;
                        }
                        ChangeKind::Delete => {}
                    }
                } else if table == Table::TypingIndicators.as_str()
                    && change.kind != ChangeKind::Delete
                {
                    if let Some(indicator) =
                        decode::<TypingIndicator>(change.record, "typing row")
                    {
                        if indicator.user_id != me {
                            record_typing(&typing, indicator).await;
                        }
                    }
                }
            }
            ChannelEvent::Broadcast { event, payload } if event == TYPING_EVENT => {
                if let Some(indicator) = decode::<TypingIndicator>(payload, "typing broadcast") {
                    if indicator.user_id != me && indicator.conversation_id == conversation {
                        record_typing(&typing, indicator).await;
                    }
                }
            }
            _ => {}
        }
    }
    debug!("Chat pump stopped for {}", conversation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::Fixture;
    use kindred_realtime::PresenceStatus;
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct Pair {
        fx: Fixture,
        alice: ChatSession,
        bob: ChatSession,
    }

    async fn pair() -> Pair {
        let fx = Fixture::new().await;
        let session = |me: UserId| {
            ChatSession::new(
                me,
                SessionConfig::default(),
                Arc::new(fx.hub.clone()),
                fx.backend.clone(),
            )
        };
        let alice = session(fx.alice);
        let bob = session(fx.bob);
        alice.start().await.unwrap();
        bob.start().await.unwrap();
        Pair { fx, alice, bob }
    }

    /// Let pumps drain. Time is paused, so this only advances the clock once
    /// every task is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_loads_list_and_presence() {
        let p = pair().await;
        settle().await;
        assert_eq!(p.alice.store().conversations().await.len(), 1);
        assert!(p.alice.is_online(p.fx.bob).await);
        assert!(p.bob.is_online(p.fx.alice).await);
        assert_eq!(
            p.alice.subscriptions().keys().await,
            vec![
                SubscriptionKey::conversations(p.fx.alice),
                SubscriptionKey::presence(p.fx.alice)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_reaches_both_sides_once() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        settle().await;

        let id = p.alice.send(c, "hey bob").await.unwrap();
        settle().await;

        let mine = p.alice.store().messages(c).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, id);

        // Bob has the thread closed: counted as unread, list refreshed
        assert_eq!(p.bob.store().unread_count(c).await, 1);
        let summary = p.bob.store().conversation(c).await.unwrap();
        assert_eq!(summary.last_message.unwrap().id, id);
        assert_eq!(summary.unread_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opening_marks_read_and_sender_sees_receipt() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        for text in ["one", "two", "three"] {
            p.alice.send(c, text).await.unwrap();
        }
        settle().await;
        assert_eq!(p.bob.store().unread_count(c).await, 3);

        let thread = p.bob.open_conversation(c).await.unwrap();
        assert_eq!(thread.len(), 3);
        settle().await;

        assert_eq!(p.bob.store().unread_count(c).await, 0);
        assert!(p.bob.store().messages(c).await.iter().all(|m| m.is_read));
        // Read receipts flow back to the sender's open thread
        assert!(p.alice.store().messages(c).await.iter().all(|m| m.is_read));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_into_open_thread_is_read_immediately() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        settle().await;

        p.alice.send(c, "hi").await.unwrap();
        settle().await;
        assert_eq!(p.bob.store().unread_count(c).await, 0);
        assert_eq!(p.bob.store().total_unread().await, 0);
        assert!(p.bob.store().messages(c).await[0].is_read);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_start_and_trailing_stop() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        settle().await;

        for _ in 0..5 {
            p.alice.keystroke(c).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(p.bob.is_typing(c, p.fx.alice).await);
        assert_eq!(p.bob.typing_users(c).await, vec![p.fx.alice]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!p.bob.is_typing(c, p.fx.alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_stops_typing() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        settle().await;

        p.alice.keystroke(c).await.unwrap();
        settle().await;
        assert!(p.bob.is_typing(c, p.fx.alice).await);

        p.alice.send(c, "done").await.unwrap();
        settle().await;
        assert!(!p.bob.is_typing(c, p.fx.alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_falls_back_to_row_when_not_live() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        settle().await;

        // Alice's channel is reconnecting
        p.alice
            .store()
            .apply_thread_event(c, ThreadEvent::Disconnected)
            .await;
        p.alice.keystroke(c).await.unwrap();
        settle().await;

        let rows = p.fx.backend.rows(Table::TypingIndicators).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["is_typing"], serde_json::json!(true));
        assert!(p.bob.is_typing(c, p.fx.alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_send_has_no_side_effects() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        p.alice.keystroke(c).await.unwrap();
        settle().await;

        let err = p.alice.send(c, "   ").await.unwrap_err();
        assert_eq!(err.error_code(), "validation");
        settle().await;
        // Still typing: no stop went out, nothing was written
        assert!(p.bob.is_typing(c, p.fx.alice).await);
        assert!(p.fx.backend.rows(Table::Messages).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystroke_on_closed_thread_is_rejected() {
        let p = pair().await;
        let err = p.alice.keystroke(p.fx.conversation).await.unwrap_err();
        assert_eq!(err.error_code(), "validation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopening_never_leaks_channels() {
        let p = pair().await;
        let c = p.fx.conversation;
        let baseline = p.fx.hub.open_channels().await;

        for _ in 0..5 {
            assert_ok!(p.alice.open_conversation(c).await);
        }
        settle().await;
        assert_eq!(p.fx.hub.open_channels().await, baseline + 1);
        assert_eq!(p.fx.hub.open_channels_on(&chat_topic(c)).await, 1);
        assert_eq!(p.alice.open_conversations().await, vec![c]);
        assert!(p.alice.store().thread_phase(c).await.is_live());

        assert!(p.alice.close_conversation(c).await);
        assert!(!p.alice.close_conversation(c).await);
        assert_eq!(p.fx.hub.open_channels().await, baseline);
        assert!(!p.alice.store().is_active(c).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_leaves_thread_idle() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.fx.hub.set_refused(&chat_topic(c), true).await;

        let err = p.alice.open_conversation(c).await.unwrap_err();
        assert_eq!(err.error_code(), "subscribe_failed");
        assert!(err.is_recoverable());
        assert_eq!(
            p.alice.store().thread_phase(c).await,
            crate::thread::ThreadPhase::Idle
        );
        assert!(!p.alice.store().is_active(c).await);
        assert!(p.alice.open_conversations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reopen_leaves_thread_idle() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        settle().await;
        assert!(p.alice.store().thread_phase(c).await.is_live());

        p.fx.hub.set_refused(&chat_topic(c), true).await;
        let err = p.alice.open_conversation(c).await.unwrap_err();
        assert_eq!(err.error_code(), "subscribe_failed");
        assert_eq!(
            p.alice.store().thread_phase(c).await,
            crate::thread::ThreadPhase::Idle
        );
        assert!(p.alice.open_conversations().await.is_empty());
        assert_eq!(p.fx.hub.open_channels_on(&chat_topic(c)).await, 0);
        assert!(
            !p.alice
                .subscriptions()
                .contains(&SubscriptionKey::chat(c))
                .await
        );

        // Retry once the topic is accepted again
        p.fx.hub.set_refused(&chat_topic(c), false).await;
        assert_ok!(p.alice.open_conversation(c).await);
        settle().await;
        assert!(p.alice.store().thread_phase(c).await.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_disconnect_resubscribes() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        settle().await;

        p.fx.hub.simulate_disconnect(&chat_topic(c)).await;
        settle().await;
        assert_eq!(
            p.alice.store().thread_phase(c).await,
            crate::thread::ThreadPhase::Subscribing
        );

        p.fx.hub.simulate_resync(&chat_topic(c)).await;
        settle().await;
        assert!(p.alice.store().thread_phase(c).await.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_leaves_nothing_running() {
        let fx = Fixture::new().await;
        fx.hub.set_refused(&conversations_topic(fx.alice), true).await;
        let alice = ChatSession::new(
            fx.alice,
            SessionConfig::default(),
            Arc::new(fx.hub.clone()),
            fx.backend.clone(),
        );

        let err = alice.start().await.unwrap_err();
        assert_eq!(err.error_code(), "subscribe_failed");
        settle().await;
        assert!(alice.subscriptions().is_empty().await);
        assert_eq!(fx.hub.open_channels().await, 0);
        assert!(fx.hub.members("online-users").await.is_empty());

        // No activity monitor survives to demote us
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(alice.presence().status().await, PresenceStatus::Online);

        fx.hub.set_refused(&conversations_topic(fx.alice), false).await;
        assert_ok!(alice.start().await);
        settle().await;
        assert!(alice.is_online(fx.alice).await);
        alice.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_match_refreshes_both_lists() {
        let p = pair().await;
        let carol = UserId::new();
        let match_id = crate::models::MatchId::new();
        p.fx.backend
            .seed(
                Table::Matches,
                serde_json::json!({
                    "id": match_id.to_string(),
                    "user_a_id": carol.to_string(),
                    "user_b_id": p.fx.bob.to_string(),
                }),
            )
            .await;

        let created = p.bob.store().conversation_for_match(match_id).await.unwrap();
        settle().await;
        let ids: Vec<ConversationId> = p
            .bob
            .store()
            .conversations()
            .await
            .iter()
            .map(|s| s.id())
            .collect();
        assert!(ids.contains(&created));
        assert_eq!(ids.len(), 2);
        // Not Alice's conversation
        assert_eq!(p.alice.store().conversations().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_announces_away() {
        let p = pair().await;
        settle().await;
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(p.alice.presence().status().await, PresenceStatus::Away);
        assert!(!p.bob.is_online(p.fx.alice).await);

        p.alice.interaction(Interaction::Pointer).await;
        settle().await;
        assert!(p.bob.is_online(p.fx.alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_everything() {
        let p = pair().await;
        let c = p.fx.conversation;
        p.alice.open_conversation(c).await.unwrap();
        p.bob.open_conversation(c).await.unwrap();
        settle().await;

        p.alice.stop().await;
        settle().await;
        assert!(!p.bob.is_online(p.fx.alice).await);
        assert!(p.alice.subscriptions().is_empty().await);

        p.bob.stop().await;
        assert_eq!(p.fx.hub.open_channels().await, 0);
    }
}
