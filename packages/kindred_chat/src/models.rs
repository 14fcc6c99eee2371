use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ChatError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse a textual id; malformed input is a validation error.
            pub fn parse(s: &str) -> Result<Self, ChatError> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ChatError::Validation(format!("invalid {} id: {:?}", $what, s)))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(UserId, "user");
uuid_id!(ConversationId, "conversation");
uuid_id!(MessageId, "message");
uuid_id!(
    /// A mutual match between two users; the seed of a conversation
    MatchId,
    "match"
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a_id: UserId,
    pub participant_b_id: UserId,
    #[serde(default)]
    pub match_id: Option<MatchId>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn involves(&self, user: UserId) -> bool {
        self.participant_a_id == user || self.participant_b_id == user
    }

    /// The other participant, as seen by `me`
    pub fn counterpart(&self, me: UserId) -> UserId {
        if self.participant_a_id == me {
            self.participant_b_id
        } else {
            self.participant_a_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    #[serde(rename = "id")]
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub const PLACEHOLDER_NAME: &'static str = "Unknown";

    /// Stand-in used when the profile lookup fails
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: Self::PLACEHOLDER_NAME.to_string(),
            avatar_url: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.display_name == Self::PLACEHOLDER_NAME && self.avatar_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

/// Outbound message; the backend assigns id, timestamp and read flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
}

/// A conversation as shown in the chat list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub counterpart: ProfileSummary,
    pub last_message: Option<Message>,
    pub unread_count: usize,
}

impl ConversationSummary {
    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    /// Timestamp the chat list is ordered by
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .or(self.conversation.last_message_at)
            .unwrap_or(self.conversation.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn now(conversation_id: ConversationId, user_id: UserId, is_typing: bool) -> Self {
        Self {
            conversation_id,
            user_id,
            is_typing,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_parse_rejects_garbage() {
        let err = ConversationId::parse("not-a-uuid").unwrap_err();
        assert_eq!(err.error_code(), "validation");
        assert!(err.to_string().contains("conversation"));

        let id = ConversationId::new();
        assert_eq!(ConversationId::parse(&id.to_string()).unwrap(), id);
        assert_eq!(format!(" {} ", id).parse::<ConversationId>().unwrap(), id);
    }

    #[test]
    fn test_counterpart() {
        let a = UserId::new();
        let b = UserId::new();
        let convo = Conversation {
            id: ConversationId::new(),
            participant_a_id: a,
            participant_b_id: b,
            match_id: None,
            last_message_id: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(convo.counterpart(a), b);
        assert_eq!(convo.counterpart(b), a);
        assert!(convo.involves(a));
        assert!(!convo.involves(UserId::new()));
    }

    #[test]
    fn test_message_row_decodes() {
        let id = MessageId::new();
        let row = json!({
            "id": id.to_string(),
            "conversation_id": ConversationId::new().to_string(),
            "sender_id": UserId::new().to_string(),
            "content": "hi",
            "created_at": "2024-05-01T12:00:00Z",
        });
        let message: Message = serde_json::from_value(row).unwrap();
        assert_eq!(message.id, id);
        assert!(!message.is_read);
    }

    #[test]
    fn test_profile_placeholder() {
        let profile = ProfileSummary::placeholder(UserId::new());
        assert_eq!(profile.display_name, "Unknown");
        assert!(profile.is_placeholder());
    }

    #[test]
    fn test_last_activity_prefers_last_message() {
        let created = "2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let sent = "2024-05-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let me = UserId::new();
        let conversation = Conversation {
            id: ConversationId::new(),
            participant_a_id: me,
            participant_b_id: UserId::new(),
            match_id: None,
            last_message_id: None,
            last_message_at: None,
            created_at: created,
        };
        let mut summary = ConversationSummary {
            counterpart: ProfileSummary::placeholder(conversation.participant_b_id),
            conversation: conversation.clone(),
            last_message: None,
            unread_count: 0,
        };
        assert_eq!(summary.last_activity(), created);

        summary.last_message = Some(Message {
            id: MessageId::new(),
            conversation_id: conversation.id,
            sender_id: me,
            content: "hey".into(),
            created_at: sent,
            is_read: false,
        });
        assert_eq!(summary.last_activity(), sent);
    }
}
