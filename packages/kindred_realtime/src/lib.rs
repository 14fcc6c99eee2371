//! Kindred Realtime - presence, subscriptions and typing signals
//!
//! Transport-agnostic building blocks for the realtime side of Kindred chat.
//! Nothing here knows about conversations or messages; the chat crate wires
//! these pieces to its store.
//!
//! - [`SubscriptionManager`] owns live channels by key, so remounting a view
//!   replaces its channel instead of stacking a second listener
//! - [`PresenceTracker`] keeps the online set and our own announcement fresh
//! - [`ActivityMonitor`] decides when the local user has gone away
//! - [`spawn_typing_debouncer`] turns keystrokes into one start and one stop
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kindred_realtime::{MemoryHub, PresenceConfig, PresenceTracker, SubscriptionManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let tracker = Arc::new(PresenceTracker::new(
//!         "user-1",
//!         PresenceConfig::default(),
//!         Arc::new(hub.clone()),
//!         Arc::new(SubscriptionManager::new()),
//!     ));
//!
//!     tracker.start().await.unwrap();
//!     println!("online: {:?}", tracker.online_users().await);
//!     tracker.stop().await;
//! }
//! ```

pub mod activity;
pub mod channel;
mod error;
pub mod memory;
pub mod presence;
pub mod subscription;
pub mod typing;

pub use activity::{ActivityConfig, ActivityMonitor, Interaction, spawn_activity_monitor};
pub use channel::{
    ChangeKind, Channel, ChannelEvent, ChannelSpec, ChannelStatus, PresenceEvent, PresenceMeta,
    PresenceStatus, RealtimeTransport, RowChange, RowFilter, Subscription,
};
pub use error::RealtimeError;
pub use memory::MemoryHub;
pub use presence::{OnlineSet, PresenceConfig, PresenceRecord, PresenceTracker};
pub use subscription::{SubscriptionKey, SubscriptionManager};
pub use typing::{
    TypingDebouncer, TypingSignal, TypingSink, TypingState, spawn_typing_debouncer,
};
