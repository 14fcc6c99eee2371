use chrono::{DateTime, Duration, Utc};
use kindred_realtime::MemoryHub;
use serde_json::json;
use std::sync::Arc;

use crate::backend::Table;
use crate::memory_backend::MemoryBackend;
use crate::models::{ConversationId, MatchId, Message, MessageId, UserId};
use crate::repository::ChatRepository;

/// Two matched users (Alice and Bob) with one conversation between them,
/// on a memory backend replicating into a memory hub.
pub(crate) struct Fixture {
    pub hub: MemoryHub,
    pub backend: Arc<MemoryBackend>,
    pub repo: ChatRepository,
    pub alice: UserId,
    pub bob: UserId,
    pub match_id: MatchId,
    pub conversation: ConversationId,
    pub epoch: DateTime<Utc>,
}

impl Fixture {
    pub async fn new() -> Self {
        let hub = MemoryHub::new();
        let backend = Arc::new(MemoryBackend::with_hub(hub.clone()));
        let alice = UserId::new();
        let bob = UserId::new();
        let match_id = MatchId::new();
        let conversation = ConversationId::new();
        let epoch = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        for (id, name) in [(alice, "Alice"), (bob, "Bob")] {
            backend
                .seed(
                    Table::Profiles,
                    json!({"id": id.to_string(), "display_name": name}),
                )
                .await;
        }
        backend
            .seed(
                Table::Matches,
                json!({
                    "id": match_id.to_string(),
                    "user_a_id": alice.to_string(),
                    "user_b_id": bob.to_string(),
                }),
            )
            .await;
        backend
            .seed(
                Table::Conversations,
                json!({
                    "id": conversation.to_string(),
                    "participant_a_id": alice.to_string(),
                    "participant_b_id": bob.to_string(),
                    "match_id": match_id.to_string(),
                    "created_at": epoch.to_rfc3339(),
                }),
            )
            .await;

        Self {
            hub,
            repo: ChatRepository::new(backend.clone()),
            backend,
            alice,
            bob,
            match_id,
            conversation,
            epoch,
        }
    }

    /// Seed a message `offset_secs` after the fixture epoch, bypassing replication.
    pub async fn seed_message(
        &self,
        sender: UserId,
        content: &str,
        offset_secs: i64,
        is_read: bool,
    ) -> Message {
        let message = Message {
            id: MessageId::new(),
            conversation_id: self.conversation,
            sender_id: sender,
            content: content.to_string(),
            created_at: self.epoch + Duration::seconds(offset_secs),
            is_read,
        };
        self.backend
            .seed(Table::Messages, serde_json::to_value(&message).unwrap())
            .await;
        message
    }

    /// A message as the backend would push it, without storing it.
    pub fn inbound(&self, sender: UserId, content: &str, offset_secs: i64) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: self.conversation,
            sender_id: sender,
            content: content.to_string(),
            created_at: self.epoch + Duration::seconds(offset_secs),
            is_read: false,
        }
    }
}
