// Typed access to the chat tables. Rows are decoded here so the store never
// touches raw JSON.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{Backend, CREATE_CONVERSATION_FROM_MATCH, Query, Table};
use crate::error::BackendError;
use crate::models::{
    Conversation, ConversationId, MatchId, Message, NewMessage, ProfileSummary, TypingIndicator,
    UserId,
};

fn decode<T: DeserializeOwned>(row: Value) -> Result<T, BackendError> {
    Ok(serde_json::from_value(row)?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter().map(decode).collect()
}

#[derive(Clone)]
pub struct ChatRepository {
    backend: Arc<dyn Backend>,
}

impl ChatRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Conversations where `user` is either participant, oldest first.
    pub async fn conversations_for(&self, user: UserId) -> Result<Vec<Conversation>, BackendError> {
        let id = user.to_string();
        let as_a = self
            .backend
            .select(&Query::from(Table::Conversations).eq("participant_a_id", id.as_str()))
            .await?;
        let as_b = self
            .backend
            .select(&Query::from(Table::Conversations).eq("participant_b_id", id.as_str()))
            .await?;

        let mut seen = HashSet::new();
        let mut conversations: Vec<Conversation> =
            decode_all(as_a.into_iter().chain(as_b).collect())?;
        conversations.retain(|c| seen.insert(c.id));
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }

    pub async fn conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, BackendError> {
        let rows = self
            .backend
            .select(&Query::from(Table::Conversations).eq("id", id.to_string()).limit(1))
            .await?;
        rows.into_iter().next().map(decode).transpose()
    }

    pub async fn profile(&self, user: UserId) -> Result<ProfileSummary, BackendError> {
        let rows = self
            .backend
            .select(&Query::from(Table::Profiles).eq("id", user.to_string()).limit(1))
            .await?;
        let row = rows.into_iter().next().ok_or_else(|| BackendError::NotFound {
            table: Table::Profiles.to_string(),
            id: user.to_string(),
        })?;
        decode(row)
    }

    pub async fn latest_message(
        &self,
        conversation: ConversationId,
    ) -> Result<Option<Message>, BackendError> {
        let rows = self
            .backend
            .select(
                &Query::from(Table::Messages)
                    .eq("conversation_id", conversation.to_string())
                    .order_by("created_at", false)
                    .limit(1),
            )
            .await?;
        rows.into_iter().next().map(decode).transpose()
    }

    /// Unread messages sent by `sender` in `conversation`
    pub async fn unread_count(
        &self,
        conversation: ConversationId,
        sender: UserId,
    ) -> Result<usize, BackendError> {
        self.backend
            .count(
                &Query::from(Table::Messages)
                    .eq("conversation_id", conversation.to_string())
                    .eq("sender_id", sender.to_string())
                    .is("is_read", false),
            )
            .await
    }

    /// The newest `limit` messages, returned oldest to newest.
    pub async fn messages_page(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, BackendError> {
        let rows = self
            .backend
            .select(
                &Query::from(Table::Messages)
                    .eq("conversation_id", conversation.to_string())
                    .order_by("created_at", false)
                    .limit(limit),
            )
            .await?;
        let mut messages: Vec<Message> = decode_all(rows)?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn insert_message(&self, message: &NewMessage) -> Result<Message, BackendError> {
        let row = self
            .backend
            .insert(Table::Messages, serde_json::to_value(message)?)
            .await?;
        decode(row)
    }

    /// Mark everything `sender` sent in `conversation` as read.
    pub async fn mark_read(
        &self,
        conversation: ConversationId,
        sender: UserId,
    ) -> Result<usize, BackendError> {
        self.backend
            .update(
                &Query::from(Table::Messages)
                    .eq("conversation_id", conversation.to_string())
                    .eq("sender_id", sender.to_string())
                    .is("is_read", false),
                json!({ "is_read": true }),
            )
            .await
    }

    pub async fn conversation_from_match(
        &self,
        match_id: MatchId,
    ) -> Result<ConversationId, BackendError> {
        let id = self
            .backend
            .rpc(
                CREATE_CONVERSATION_FROM_MATCH,
                json!({ "match_id": match_id.to_string() }),
            )
            .await?;
        decode(id)
    }

    pub async fn upsert_typing(&self, indicator: &TypingIndicator) -> Result<(), BackendError> {
        self.backend
            .upsert(
                Table::TypingIndicators,
                serde_json::to_value(indicator)?,
                &["conversation_id", "user_id"],
            )
            .await?;
        Ok(())
    }
}
