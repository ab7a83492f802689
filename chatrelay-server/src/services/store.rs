use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::models::{Conversation, ConversationSummary, Message, MessageRole, Timestamp};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable record of conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self) -> Result<Conversation, StoreError>;

    /// Appends one message and returns the updated conversation.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        created_at: Timestamp,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation, StoreError>;

    /// Summaries ordered by most recent update first.
    async fn list_conversations(&self, limit: usize)
    -> Result<Vec<ConversationSummary>, StoreError>;
}

pub type SharedStore = Arc<dyn ConversationStore>;

/// Process-local store used when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(Uuid::new_v4(), Timestamp::now());
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        created_at: Timestamp,
    ) -> Result<Conversation, StoreError> {
        let mut guard = self.conversations.write().await;
        let conversation = guard
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;

        let sequence = conversation.next_sequence();
        conversation.messages.push(Message {
            role,
            content: content.to_string(),
            created_at,
            sequence,
        });
        conversation.updated_at = Timestamp::now().max(created_at);
        Ok(conversation.clone())
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation, StoreError> {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound(conversation_id))
    }

    async fn list_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let guard = self.conversations.read().await;
        let mut summaries: Vec<ConversationSummary> =
            guard.values().map(Conversation::summary).collect();
        drop(guard);

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        summaries.truncate(limit);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_increasing_sequences() {
        let store = InMemoryConversationStore::new();
        let conversation = store.create_conversation().await.unwrap();
        let stamp = Timestamp::now();

        store
            .append_message(conversation.id, MessageRole::User, "a", stamp)
            .await
            .unwrap();
        let updated = store
            .append_message(conversation.id, MessageRole::Assistant, "b", stamp)
            .await
            .unwrap();

        let sequences: Vec<u64> = updated.messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert!(updated.updated_at >= conversation.updated_at);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let store = InMemoryConversationStore::new();
        let missing = Uuid::new_v4();

        assert!(matches!(
            store.get_conversation(missing).await,
            Err(StoreError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            store
                .append_message(missing, MessageRole::User, "x", Timestamp::now())
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_is_most_recent_first_and_limited() {
        let store = InMemoryConversationStore::new();
        let older = store.create_conversation().await.unwrap();
        let newer = store.create_conversation().await.unwrap();
        let later = Timestamp(chrono::Utc::now() + chrono::Duration::seconds(5));
        store
            .append_message(older.id, MessageRole::User, "bump", later)
            .await
            .unwrap();

        let listed = store.list_conversations(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[0].messages_count, 1);
        assert_eq!(listed[1].id, newer.id);

        assert_eq!(store.list_conversations(1).await.unwrap().len(), 1);
    }
}
