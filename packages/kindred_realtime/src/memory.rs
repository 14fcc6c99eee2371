//! In-process realtime transport
//!
//! `MemoryHub` implements [`RealtimeTransport`] entirely in memory. It keeps a
//! registry of open connections per topic and fans out row changes, presence
//! and broadcasts the way a hosted realtime service would. Used by the
//! simulator and by tests across the workspace.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::channel::{
    Channel, ChannelEvent, ChannelSpec, ChannelStatus, PresenceEvent, PresenceMeta,
    RealtimeTransport, RowChange, Subscription,
};
use crate::error::RealtimeError;

/// One open channel as seen by the hub
struct Connection {
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    tracked: Option<PresenceMeta>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<u64, Connection>,
    refused_topics: HashSet<String>,
}

impl HubState {
    fn on_topic<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = (&'a u64, &'a Connection)> {
        self.connections
            .iter()
            .filter(move |(_, c)| c.spec.topic == topic)
    }

    /// Current members of a topic, one entry per user (latest announcement wins).
    fn members(&self, topic: &str) -> Vec<PresenceMeta> {
        let mut by_user: HashMap<&str, &PresenceMeta> = HashMap::new();
        for (_, conn) in self.on_topic(topic) {
            if let Some(meta) = &conn.tracked {
                let newer = by_user
                    .get(meta.user_id.as_str())
                    .is_none_or(|existing| existing.online_at <= meta.online_at);
                if newer {
                    by_user.insert(meta.user_id.as_str(), meta);
                }
            }
        }
        let mut members: Vec<PresenceMeta> = by_user.into_values().cloned().collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        members
    }

    /// Deliver a presence diff followed by the authoritative sync.
    fn fan_presence(&self, topic: &str, diff: PresenceEvent) {
        let sync = PresenceEvent::Sync {
            members: self.members(topic),
        };
        for (_, conn) in self.on_topic(topic).filter(|(_, c)| c.spec.presence) {
            let _ = conn.tx.send(ChannelEvent::Presence {
                presence: diff.clone(),
            });
            let _ = conn.tx.send(ChannelEvent::Presence {
                presence: sync.clone(),
            });
        }
    }
}

struct HubInner {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

/// In-memory realtime service
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Push a row change to every channel whose row filters match it.
    /// Returns the number of channels it was delivered to.
    pub async fn publish(&self, change: RowChange) -> usize {
        let state = self.inner.state.lock().await;
        let mut delivered = 0;
        for conn in state.connections.values() {
            if conn.spec.row_filters.iter().any(|f| f.matches(&change)) {
                let sent = conn.tx.send(ChannelEvent::Row {
                    change: change.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(
            "Row change on {} ({:?}) delivered to {} channel(s)",
            change.table, change.kind, delivered
        );
        delivered
    }

    /// Number of channels currently open across all topics
    pub async fn open_channels(&self) -> usize {
        self.inner.state.lock().await.connections.len()
    }

    /// Number of channels currently open on one topic
    pub async fn open_channels_on(&self, topic: &str) -> usize {
        self.inner.state.lock().await.on_topic(topic).count()
    }

    /// Presence members of a topic as the hub sees them
    pub async fn members(&self, topic: &str) -> Vec<PresenceMeta> {
        self.inner.state.lock().await.members(topic)
    }

    /// Make subsequent `open` calls for `topic` fail (or succeed again).
    pub async fn set_refused(&self, topic: &str, refused: bool) {
        let mut state = self.inner.state.lock().await;
        if refused {
            state.refused_topics.insert(topic.to_string());
        } else {
            state.refused_topics.remove(topic);
        }
    }

    /// Simulate a dropped connection on `topic`: every channel sees
    /// `Disconnected` and nothing more until [`Self::simulate_resync`].
    pub async fn simulate_disconnect(&self, topic: &str) {
        let state = self.inner.state.lock().await;
        for (_, conn) in state.on_topic(topic) {
            let _ = conn.tx.send(ChannelEvent::Status {
                status: ChannelStatus::Disconnected,
            });
        }
        debug!("Simulated disconnect on topic {}", topic);
    }

    /// Finish a reconnect on `topic`: `Subscribed`, then a fresh presence
    /// sync for presence channels.
    pub async fn simulate_resync(&self, topic: &str) {
        let state = self.inner.state.lock().await;
        let members = state.members(topic);
        for (_, conn) in state.on_topic(topic) {
            let _ = conn.tx.send(ChannelEvent::Status {
                status: ChannelStatus::Subscribed,
            });
            if conn.spec.presence {
                let _ = conn.tx.send(ChannelEvent::Presence {
                    presence: PresenceEvent::Sync {
                        members: members.clone(),
                    },
                });
            }
        }
        debug!("Simulated resync on topic {}", topic);
    }

    /// Dropped connection followed by a transparent reconnect
    pub async fn simulate_reconnect(&self, topic: &str) {
        self.simulate_disconnect(topic).await;
        self.simulate_resync(topic).await;
    }
}

#[async_trait]
impl RealtimeTransport for MemoryHub {
    async fn open(&self, spec: ChannelSpec) -> Result<Subscription, RealtimeError> {
        let mut state = self.inner.state.lock().await;
        if state.refused_topics.contains(&spec.topic) {
            return Err(RealtimeError::SubscribeFailed {
                topic: spec.topic,
                reason: "refused by hub".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Status {
            status: ChannelStatus::Subscribed,
        });
        if spec.presence {
            let _ = tx.send(ChannelEvent::Presence {
                presence: PresenceEvent::Sync {
                    members: state.members(&spec.topic),
                },
            });
        }

        let topic = spec.topic.clone();
        state.connections.insert(
            id,
            Connection {
                spec,
                tx,
                tracked: None,
            },
        );
        debug!(
            "Opened memory channel {} on topic {} ({} open)",
            id,
            topic,
            state.connections.len()
        );

        Ok(Subscription {
            channel: Arc::new(MemoryChannel {
                hub: self.inner.clone(),
                id,
                topic,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// Channel handle issued by [`MemoryHub`]
pub struct MemoryChannel {
    hub: Arc<HubInner>,
    id: u64,
    topic: String,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn closed_error(&self) -> RealtimeError {
        RealtimeError::ChannelClosed(self.topic.clone())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn track(&self, meta: PresenceMeta) -> Result<(), RealtimeError> {
        let mut state = self.hub.state.lock().await;
        let conn = state
            .connections
            .get_mut(&self.id)
            .ok_or_else(|| self.closed_error())?;
        conn.tracked = Some(meta.clone());
        state.fan_presence(&self.topic, PresenceEvent::Join { meta });
        Ok(())
    }

    async fn untrack(&self) -> Result<(), RealtimeError> {
        let mut state = self.hub.state.lock().await;
        let conn = state
            .connections
            .get_mut(&self.id)
            .ok_or_else(|| self.closed_error())?;
        if let Some(meta) = conn.tracked.take() {
            state.fan_presence(&self.topic, PresenceEvent::Leave { meta });
        }
        Ok(())
    }

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), RealtimeError> {
        let state = self.hub.state.lock().await;
        if !state.connections.contains_key(&self.id) {
            return Err(self.closed_error());
        }
        for (_, conn) in state.on_topic(&self.topic).filter(|(id, _)| **id != self.id) {
            let _ = conn.tx.send(ChannelEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.hub.state.lock().await;
        if let Some(conn) = state.connections.remove(&self.id) {
            let _ = conn.tx.send(ChannelEvent::Status {
                status: ChannelStatus::Closed,
            });
            if let Some(meta) = conn.tracked {
                state.fan_presence(&self.topic, PresenceEvent::Leave { meta });
            }
        }
        debug!(
            "Closed memory channel {} on topic {} ({} open)",
            self.id,
            self.topic,
            state.connections.len()
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
