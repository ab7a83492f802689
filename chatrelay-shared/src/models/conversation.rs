use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{Message, MessageRole, Timestamp};

/// A conversation as held by the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub messages: Vec<Message>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    #[must_use]
    pub fn new(id: Uuid, created_at: Timestamp) -> Self {
        Self {
            id,
            messages: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Sequence number the next appended message receives.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.messages
            .iter()
            .map(|message| message.sequence + 1)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            messages_count: self.messages.len(),
            last_message: self.messages.last().map(LastMessage::from),
        }
    }
}

/// Most recent message of a conversation, as shown in listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: Timestamp,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub messages_count: usize,
    pub last_message: Option<LastMessage>,
}
