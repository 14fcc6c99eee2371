//! Presence Tracker
//!
//! Maintains the set of online users from a shared presence channel and keeps
//! this client's own announcement fresh.
//!
//! ## Event handling
//!
//! - `Join` adds (or refreshes) the announced user
//! - `Leave` removes the user
//! - `Sync` replaces the whole set; it is authoritative and resolves any
//!   join/leave races from reconnects
//! - transport `Disconnected` clears the set ("leave-all"); the sync that
//!   follows the transport's own reconnect rebuilds it
//!
//! The tracker has no retry logic of its own. Failed announcements are logged
//! and the next heartbeat tries again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ChannelEvent, ChannelSpec, ChannelStatus, PresenceEvent, PresenceMeta,
    PresenceStatus, RealtimeTransport,
};
use crate::error::RealtimeError;
use crate::subscription::{SubscriptionKey, SubscriptionManager};

/// Heartbeat period for re-announcing liveness
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// One user's presence as last announced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    /// False when the user announced themselves as away
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl From<&PresenceMeta> for PresenceRecord {
    fn from(meta: &PresenceMeta) -> Self {
        Self {
            user_id: meta.user_id.clone(),
            online: meta.status == PresenceStatus::Online,
            last_seen: meta.online_at,
        }
    }
}

/// The online set, updated purely from presence events
#[derive(Clone, Debug, Default)]
pub struct OnlineSet {
    records: HashMap<String, PresenceRecord>,
}

impl OnlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one presence event. Returns true if the set changed.
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        match event {
            PresenceEvent::Join { meta } => {
                let record = PresenceRecord::from(meta);
                self.records.insert(record.user_id.clone(), record.clone()) != Some(record)
            }
            PresenceEvent::Leave { meta } => self.records.remove(&meta.user_id).is_some(),
            PresenceEvent::Sync { members } => {
                let next: HashMap<String, PresenceRecord> = members
                    .iter()
                    .map(|m| (m.user_id.clone(), PresenceRecord::from(m)))
                    .collect();
                let changed = next != self.records;
                self.records = next;
                changed
            }
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.records.get(user_id).is_some_and(|r| r.online)
    }

    pub fn record(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Online (not away) user ids, sorted
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .records
            .values()
            .filter(|r| r.online)
            .map(|r| r.user_id.clone())
            .collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Tunables for the presence tracker
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// Topic of the shared presence group
    pub topic: String,
    pub heartbeat: Duration,
    /// Minimum spacing between interaction-driven announcements
    pub interaction_debounce: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            topic: "online-users".to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
            interaction_debounce: Duration::from_secs(10),
        }
    }
}

/// Tracks who is online and announces this client
pub struct PresenceTracker {
    user_id: String,
    config: PresenceConfig,
    transport: Arc<dyn RealtimeTransport>,
    subscriptions: Arc<SubscriptionManager>,
    online: Arc<RwLock<OnlineSet>>,
    status: RwLock<PresenceStatus>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    last_announce: Mutex<Option<Instant>>,
    /// Cancels the pump and heartbeat of the current run
    cancel: Mutex<Option<CancellationToken>>,
}

impl PresenceTracker {
    pub fn new(
        user_id: impl Into<String>,
        config: PresenceConfig,
        transport: Arc<dyn RealtimeTransport>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            config,
            transport,
            subscriptions,
            online: Arc::new(RwLock::new(OnlineSet::new())),
            status: RwLock::new(PresenceStatus::Online),
            channel: RwLock::new(None),
            last_announce: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn key(&self) -> SubscriptionKey {
        SubscriptionKey::presence(&self.user_id)
    }

    /// Join the presence group, announce ourselves and start the heartbeat.
    /// Calling `start` again restarts cleanly on a fresh channel.
    pub async fn start(self: &Arc<Self>) -> Result<(), RealtimeError> {
        // Cancel the previous run before its channel is replaced so its pump
        // cannot clobber the new set with late events.
        if let Some(previous) = self.cancel.lock().await.take() {
            previous.cancel();
        }

        let transport = self.transport.clone();
        let spec = ChannelSpec::new(self.config.topic.clone()).with_presence();
        let subscription = self
            .subscriptions
            .acquire(self.key(), || async move { transport.open(spec).await })
            .await?;

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());
        *self.channel.write().await = Some(subscription.channel.clone());
        self.online.write().await.clear();

        tokio::spawn(run_presence_pump(
            subscription.events,
            self.online.clone(),
            cancel.clone(),
            self.config.topic.clone(),
        ));

        let tracker = self.clone();
        let heartbeat = self.config.heartbeat;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tracker.touch().await,
                }
            }
            debug!("Presence heartbeat stopped for {}", tracker.user_id);
        });

        self.touch().await;
        info!(
            "Presence started for {} on topic {}",
            self.user_id, self.config.topic
        );
        Ok(())
    }

    /// Withdraw our announcement, stop background tasks and release the channel.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        let channel = self.channel.write().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.untrack().await {
                debug!("Presence untrack failed for {}: {}", self.user_id, e);
            }
        }
        self.subscriptions.release(&self.key()).await;
        self.online.write().await.clear();
        info!("Presence stopped for {}", self.user_id);
    }

    /// Re-announce liveness with the current status.
    pub async fn touch(&self) {
        let channel = self.channel.read().await.clone();
        let Some(channel) = channel else {
            return;
        };
        let status = *self.status.read().await;
        *self.last_announce.lock().await = Some(Instant::now());
        if let Err(e) = channel.track(PresenceMeta::new(&self.user_id, status)).await {
            warn!("Presence announce failed for {}: {}", self.user_id, e);
        }
    }

    /// Interaction-driven touch. Returns true if an announcement went out,
    /// false if it was debounced.
    pub async fn record_interaction(&self) -> bool {
        {
            let last = self.last_announce.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.config.interaction_debounce {
                    return false;
                }
            }
        }
        self.touch().await;
        true
    }

    /// Change our announced status (e.g. demotion to away) and announce it now.
    pub async fn announce(&self, status: PresenceStatus) {
        let previous = std::mem::replace(&mut *self.status.write().await, status);
        if previous != status {
            info!("Presence status for {}: {:?} -> {:?}", self.user_id, previous, status);
        }
        self.touch().await;
    }

    pub async fn status(&self) -> PresenceStatus {
        *self.status.read().await
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.online.read().await.is_online(user_id)
    }

    pub async fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.online.read().await.record(user_id).cloned()
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.online.read().await.online_users()
    }
}

async fn run_presence_pump(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    online: Arc<RwLock<OnlineSet>>,
    cancel: CancellationToken,
    topic: String,
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

        let mut set = online.write().await;
        if cancel.is_cancelled() {
            break;
        }
        match event {
            ChannelEvent::Presence { presence } => {
                if set.apply(&presence) {
                    debug!("[PRESENCE {}] {} member(s) after update", topic, set.len());
                }
            }
            ChannelEvent::Status {
                status: ChannelStatus::Disconnected,
            } => {
                debug!("[PRESENCE {}] disconnected, clearing online set", topic);
                set.clear();
            }
            ChannelEvent::Status {
                status: ChannelStatus::Closed,
            } => {
                set.clear();
                break;
            }
            _ => {}
        }
    }
    debug!("[PRESENCE {}] pump stopped", topic);
}
