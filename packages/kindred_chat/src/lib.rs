//! Kindred Chat - conversation store and realtime chat session
//!
//! The client-side half of Kindred messaging between matched users:
//!
//! - [`ConversationStore`] caches the chat list and open threads, with
//!   unread bookkeeping and read receipts
//! - [`ChatSession`] is the per-user context that wires presence, channel
//!   subscriptions and typing signals into the store
//! - [`Backend`] is the row-store seam; [`MemoryBackend`] replicates into a
//!   [`kindred_realtime::MemoryHub`] for tests and the simulator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kindred_chat::{ChatSession, MemoryBackend, SessionConfig, UserId};
//! use kindred_realtime::MemoryHub;
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let backend = Arc::new(MemoryBackend::with_hub(hub.clone()));
//!     let config = SessionConfig::default();
//!     let session = ChatSession::new(UserId::new(), config, Arc::new(hub), backend);
//!
//!     let chats = session.start().await.unwrap();
//!     println!("{} conversation(s)", chats.len());
//!     session.stop().await;
//! }
//! ```

pub mod backend;
pub mod config;
mod error;
pub mod logging;
pub mod memory_backend;
pub mod models;
pub mod repository;
pub mod session;
pub mod store;
pub mod thread;
pub mod typing_registry;

#[cfg(test)]
mod test_helpers;

pub use backend::{Backend, Filter, Order, Query, Table};
pub use config::{FileConfig, SessionConfig, load_config};
pub use error::{BackendError, ChatError, RecoveryAction};
pub use memory_backend::MemoryBackend;
pub use models::{
    Conversation, ConversationId, ConversationSummary, MatchId, Message, MessageId, NewMessage,
    ProfileSummary, TypingIndicator, UserId,
};
pub use repository::ChatRepository;
pub use session::ChatSession;
pub use store::{ConversationStore, StoreConfig};
pub use thread::{ThreadEvent, ThreadPhase};
pub use typing_registry::TypingRegistry;
