//! Subscription Manager
//!
//! Owns every live channel handle, keyed by a caller-chosen string. Acquiring
//! a key that is already held tears the old channel down before the new one is
//! built, so remounting a view can never leak or duplicate a listener.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::channel::{Channel, Subscription};
use crate::error::RealtimeError;

/// Key identifying one logical subscription
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Message + typing channel of one conversation
    pub fn chat(conversation_id: impl std::fmt::Display) -> Self {
        Self(format!("chat_{}", conversation_id))
    }

    /// Shared presence group, as joined by one user
    pub fn presence(user_id: impl std::fmt::Display) -> Self {
        Self(format!("presence_{}", user_id))
    }

    /// Row changes on a user's conversation list
    pub fn conversations(user_id: impl std::fmt::Display) -> Self {
        Self(format!("conversations_{}", user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Keyed registry of live channels
#[derive(Default)]
pub struct SubscriptionManager {
    handles: Mutex<HashMap<SubscriptionKey, Arc<dyn Channel>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is held under `key` with a freshly built subscription.
    ///
    /// The previous channel (if any) is closed before `factory` runs. The
    /// registry lock is held across both steps so concurrent acquires of the
    /// same key serialize. On factory failure the key is left empty.
    pub async fn acquire<F, Fut>(
        &self,
        key: impl Into<SubscriptionKey>,
        factory: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Subscription, RealtimeError>>,
    {
        let key = key.into();
        let mut handles = self.handles.lock().await;

        if let Some(previous) = handles.remove(&key) {
            debug!("Replacing subscription {} (topic {})", key, previous.topic());
            previous.close().await;
        }

        let subscription = factory().await?;
        handles.insert(key.clone(), subscription.channel.clone());
        debug!(
            "Acquired subscription {} on topic {} ({} live)",
            key,
            subscription.channel.topic(),
            handles.len()
        );
        Ok(subscription)
    }

    /// Close and forget the channel under `key`. Returns false if absent.
    pub async fn release(&self, key: &SubscriptionKey) -> bool {
        let removed = self.handles.lock().await.remove(key);
        match removed {
            Some(channel) => {
                channel.close().await;
                debug!("Released subscription {}", key);
                true
            }
            None => false,
        }
    }

    /// Close every tracked channel (sign-out / teardown)
    pub async fn release_all(&self) -> usize {
        let drained: Vec<(SubscriptionKey, Arc<dyn Channel>)> =
            self.handles.lock().await.drain().collect();
        let count = drained.len();
        for (_, channel) in drained {
            channel.close().await;
        }
        if count > 0 {
            debug!("Released all {} subscription(s)", count);
        }
        count
    }

    pub async fn get(&self, key: &SubscriptionKey) -> Option<Arc<dyn Channel>> {
        self.handles.lock().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &SubscriptionKey) -> bool {
        self.handles.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.handles.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
