//! Realtime Channel Model
//!
//! A channel is a topic-scoped subscription on a realtime transport. One
//! channel can carry three kinds of traffic:
//! - row changes, scoped by table and an optional column equality
//! - presence (join / leave / full-state sync)
//! - small broadcast payloads (typing signals)
//!
//! Transports deliver inbound traffic through the `events` receiver of the
//! [`Subscription`] returned by [`RealtimeTransport::open`]; outbound traffic
//! goes through the [`Channel`] handle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RealtimeError;

/// Kind of row mutation carried by a [`RowChange`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row mutation pushed by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

/// Row-change scope: a table, optionally narrowed to some change kinds and
/// one `column = value` equality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub table: String,
    /// Empty means every kind
    #[serde(default)]
    pub kinds: Vec<ChangeKind>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl RowFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kinds: Vec::new(),
            column: None,
            value: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.column = Some(column.into());
        self.value = Some(value.into());
        self
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&change.kind) {
            return false;
        }
        match (&self.column, &self.value) {
            (Some(column), Some(value)) => {
                // Deletes only carry the old row
                let row = match change.kind {
                    ChangeKind::Delete => change.old_record.as_ref().unwrap_or(&change.record),
                    _ => &change.record,
                };
                row.get(column) == Some(value)
            }
            _ => true,
        }
    }
}

/// Announced liveness of a user
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
}

/// Presence payload announced through [`Channel::track`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: String,
    pub status: PresenceStatus,
    pub online_at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn new(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            online_at: Utc::now(),
        }
    }

    pub fn online(user_id: impl Into<String>) -> Self {
        Self::new(user_id, PresenceStatus::Online)
    }
}

/// Presence traffic on a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Join { meta: PresenceMeta },
    Leave { meta: PresenceMeta },
    /// Authoritative full state; replaces whatever the receiver had
    Sync { members: Vec<PresenceMeta> },
}

/// Transport-level lifecycle of a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    /// Connection dropped; the transport is reconnecting on its own
    Disconnected,
    /// Terminal. No further events follow.
    Closed,
}

/// Everything a channel can deliver
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    Status { status: ChannelStatus },
    Row { change: RowChange },
    Presence { presence: PresenceEvent },
    Broadcast { event: String, payload: Value },
}

/// What to subscribe to when opening a channel
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    pub topic: String,
    pub row_filters: Vec<RowFilter>,
    pub presence: bool,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            row_filters: Vec::new(),
            presence: false,
        }
    }

    pub fn with_rows(mut self, filter: RowFilter) -> Self {
        self.row_filters.push(filter);
        self
    }

    pub fn with_presence(mut self) -> Self {
        self.presence = true;
        self
    }
}

/// Outbound half of an open channel
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Announce (or re-announce) this client's presence on the topic
    async fn track(&self, meta: PresenceMeta) -> Result<(), RealtimeError>;

    /// Withdraw this client's presence
    async fn untrack(&self) -> Result<(), RealtimeError>;

    /// Send a payload to every other subscriber of the topic
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), RealtimeError>;

    /// Tear the channel down. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An open channel plus its inbound event stream
pub struct Subscription {
    pub channel: Arc<dyn Channel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.channel.topic())
            .finish()
    }
}

/// A realtime backend capable of opening channels
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open(&self, spec: ChannelSpec) -> Result<Subscription, RealtimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(table: &str, record: Value) -> RowChange {
        RowChange {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            record,
            old_record: None,
        }
    }

    #[test]
    fn test_row_filter_table_only() {
        let filter = RowFilter::table("messages");
        assert!(filter.matches(&insert("messages", json!({"id": 1}))));
        assert!(!filter.matches(&insert("profiles", json!({"id": 1}))));
    }

    #[test]
    fn test_row_filter_equality() {
        let filter = RowFilter::table("messages").eq("conversation_id", "c-1");
        assert!(filter.matches(&insert("messages", json!({"conversation_id": "c-1"}))));
        assert!(!filter.matches(&insert("messages", json!({"conversation_id": "c-2"}))));
        assert!(!filter.matches(&insert("messages", json!({}))));
    }

    #[test]
    fn test_row_filter_kinds() {
        let filter = RowFilter::table("messages").only(ChangeKind::Update);
        assert!(!filter.matches(&insert("messages", json!({}))));

        let update = RowChange {
            kind: ChangeKind::Update,
            ..insert("messages", json!({}))
        };
        assert!(filter.matches(&update));
    }

    #[test]
    fn test_row_filter_delete_uses_old_record() {
        let filter = RowFilter::table("conversations").eq("participant_a_id", "u-1");
        let delete = RowChange {
            table: "conversations".into(),
            kind: ChangeKind::Delete,
            record: json!({}),
            old_record: Some(json!({"participant_a_id": "u-1"})),
        };
        assert!(filter.matches(&delete));
    }

    #[test]
    fn test_channel_event_serde() {
        let event = ChannelEvent::Presence {
            presence: PresenceEvent::Sync {
                members: vec![PresenceMeta::online("u-1")],
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"presence\""));
        assert!(json.contains("\"event\":\"sync\""));
        let back: ChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
