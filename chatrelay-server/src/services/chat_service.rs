use shared::models::{
    ChatAccepted, ChatRequest, ConversationSummary, CursorError, MessageRole, MessagesPage,
    PageCursor, Timestamp,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    broadcaster::StreamBroadcaster,
    history_pager::HistoryPager,
    registry::{Delivery, Subscription, Topic},
    store::{SharedStore, StoreError},
    stream_controller::{SharedStreamController, StreamError},
};

pub const LIST_DEFAULT_LIMIT: usize = 50;
pub const LIST_MAX_LIMIT: usize = 100;
const STATUS_STREAMING: &str = "streaming";

#[derive(Debug, Error)]
pub enum ChatServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("a reply is already streaming for conversation {0}")]
    Conflict(Uuid),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Run(StreamError),
}

impl From<StoreError> for ChatServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<StreamError> for ChatServiceError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Conflict(id) => Self::Conflict(id),
            StreamError::Persistence(store) => store.into(),
            other @ StreamError::Generator(_) => Self::Run(other),
        }
    }
}

impl From<CursorError> for ChatServiceError {
    fn from(err: CursorError) -> Self {
        Self::Validation(format!("invalid 'before' cursor: {err}"))
    }
}

pub type ChatResult<T> = Result<T, ChatServiceError>;

/// Request-facing operations over the store, the run controller, the
/// pager and the broadcaster.
#[derive(Clone)]
pub struct ChatService {
    store: SharedStore,
    broadcaster: StreamBroadcaster,
    controller: SharedStreamController,
    pager: HistoryPager,
}

impl ChatService {
    pub fn new(
        store: SharedStore,
        broadcaster: StreamBroadcaster,
        controller: SharedStreamController,
        pager: HistoryPager,
    ) -> Self {
        Self {
            store,
            broadcaster,
            controller,
            pager,
        }
    }

    /// Records the user message and starts the reply run in the background.
    ///
    /// The run slot is reserved before anything is written, so a conflicting
    /// request leaves the conversation untouched.
    #[instrument(skip(self, request), fields(conversation_id = ?request.conversation_id))]
    pub async fn post_chat(&self, request: ChatRequest) -> ChatResult<ChatAccepted> {
        let input = request.input.trim();
        if input.is_empty() {
            return Err(ChatServiceError::Validation("input must not be empty".into()));
        }

        let requested = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());
        let (conversation, created) = match requested {
            Some(raw) => (self.store.get_conversation(parse_id(raw)?).await?, false),
            None => (self.store.create_conversation().await?, true),
        };

        let guard = self.controller.begin_run(conversation.id)?;
        let updated = self
            .store
            .append_message(conversation.id, MessageRole::User, input, Timestamp::now())
            .await?;

        if created {
            info!(conversation_id = %updated.id, "conversation created");
            self.broadcaster.emit_conversation_created(updated.summary());
        }
        debug!(conversation_id = %updated.id, run_id = %guard.run_id(), "starting reply run");
        self.controller.spawn_run(guard, input.to_string());

        Ok(ChatAccepted {
            conversation_id: updated.id,
            status: STATUS_STREAMING.to_string(),
        })
    }

    /// # Errors
    /// Validation for malformed ids or cursors, `NotFound` for unknown conversations.
    pub async fn get_page(
        &self,
        raw_id: &str,
        before: Option<&str>,
        limit: Option<i64>,
    ) -> ChatResult<MessagesPage> {
        let conversation_id = parse_id(raw_id)?;
        let cursor = before
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(str::parse::<PageCursor>)
            .transpose()?;

        Ok(self.pager.get_page(conversation_id, cursor, limit).await?)
    }

    /// Recency-ordered summaries; `limit` defaults to 50 and is clamped to
    /// `[1, 100]`.
    pub async fn list_conversations(&self, limit: Option<i64>) -> ChatResult<Vec<ConversationSummary>> {
        Ok(self.store.list_conversations(list_limit(limit)).await?)
    }

    /// Attaches an observer to a known conversation.
    ///
    /// # Errors
    /// Validation for malformed ids, `NotFound` for unknown conversations.
    pub async fn subscribe_conversation(
        &self,
        raw_id: &str,
    ) -> ChatResult<(Uuid, Subscription, mpsc::Receiver<Delivery>)> {
        let conversation_id = parse_id(raw_id)?;
        self.store.get_conversation(conversation_id).await?;
        let (subscription, receiver) = self
            .broadcaster
            .subscribe(Topic::Conversation(conversation_id));
        Ok((conversation_id, subscription, receiver))
    }

    pub fn subscribe_all(&self) -> (Subscription, mpsc::Receiver<Delivery>) {
        self.broadcaster.subscribe(Topic::AllConversations)
    }

    pub fn controller(&self) -> &SharedStreamController {
        &self.controller
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("pager", &self.pager)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

fn parse_id(raw: &str) -> ChatResult<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ChatServiceError::Validation(format!("invalid conversation id '{raw}'")))
}

fn list_limit(requested: Option<i64>) -> usize {
    match requested {
        None => LIST_DEFAULT_LIMIT,
        Some(value) if value < 1 => 1,
        Some(value) => usize::try_from(value).map_or(LIST_MAX_LIMIT, |v| v.min(LIST_MAX_LIMIT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        generator::testing::ScriptedGenerator,
        registry::SubscriberRegistry,
        store::{ConversationStore, InMemoryConversationStore},
        stream_controller::ResponseStreamController,
    };
    use shared::{config::server::PaginationConfig, models::StreamEvent};
    use std::{sync::Arc, time::Duration};

    struct Fixture {
        service: ChatService,
        store: Arc<InMemoryConversationStore>,
    }

    fn fixture(generator: ScriptedGenerator) -> Fixture {
        let store = Arc::new(InMemoryConversationStore::new());
        let shared_store: SharedStore = store.clone();
        let broadcaster = StreamBroadcaster::new(Arc::new(SubscriberRegistry::new(64)));
        let controller = Arc::new(ResponseStreamController::new(
            broadcaster.clone(),
            shared_store.clone(),
            Arc::new(generator),
            None,
        ));
        let pager = HistoryPager::new(shared_store.clone(), &PaginationConfig::default());
        Fixture {
            service: ChatService::new(shared_store, broadcaster, controller, pager),
            store,
        }
    }

    fn request(conversation_id: Option<String>, input: &str) -> ChatRequest {
        ChatRequest {
            conversation_id,
            input: input.to_string(),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> StreamEvent {
        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        StreamEvent::from_frame(&delivery).unwrap()
    }

    #[tokio::test]
    async fn test_new_conversation_is_announced_and_streamed() {
        let fx = fixture(ScriptedGenerator::new(&["Hi ", "there"]));
        let (_all, mut all_rx) = fx.service.subscribe_all();

        let accepted = fx.service.post_chat(request(None, "  hello  ")).await.unwrap();
        assert_eq!(accepted.status, "streaming");

        match recv(&mut all_rx).await {
            StreamEvent::ConversationCreated(summary) => {
                assert_eq!(summary.id, accepted.conversation_id);
                assert_eq!(summary.messages_count, 1);
                assert_eq!(summary.last_message.unwrap().content, "hello");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let raw_id = accepted.conversation_id.to_string();
        for _ in 0..50 {
            if !fx.service.controller().is_running(accepted.conversation_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let page = fx.service.get_page(&raw_id, None, None).await.unwrap();
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "Hi there"]);
    }

    #[tokio::test]
    async fn test_blank_input_is_rejected() {
        let fx = fixture(ScriptedGenerator::new(&["x"]));
        let result = fx.service.post_chat(request(None, "   ")).await;
        assert!(matches!(result, Err(ChatServiceError::Validation(_))));
        assert!(fx.store.list_conversations(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_or_malformed_conversation_ids_are_reported() {
        let fx = fixture(ScriptedGenerator::new(&["x"]));

        let missing = Uuid::new_v4();
        assert!(matches!(
            fx.service.post_chat(request(Some(missing.to_string()), "hi")).await,
            Err(ChatServiceError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            fx.service.post_chat(request(Some("nope".into()), "hi")).await,
            Err(ChatServiceError::Validation(_))
        ));
        assert!(matches!(
            fx.service.get_page("nope", None, None).await,
            Err(ChatServiceError::Validation(_))
        ));
        assert!(matches!(
            fx.service.subscribe_conversation(&missing.to_string()).await,
            Err(ChatServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_post_persists_nothing() {
        let generator = ScriptedGenerator::new(&["slow "]).paced(Duration::from_millis(200));
        let fx = fixture(generator);
        let accepted = fx.service.post_chat(request(None, "first")).await.unwrap();
        let id = accepted.conversation_id.to_string();

        let result = fx.service.post_chat(request(Some(id), "second")).await;
        assert!(matches!(result, Err(ChatServiceError::Conflict(_))));

        let stored = fx.store.get_conversation(accepted.conversation_id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "first");
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_a_validation_error() {
        let fx = fixture(ScriptedGenerator::new(&[]));
        let conversation = fx.store.create_conversation().await.unwrap();

        let result = fx
            .service
            .get_page(&conversation.id.to_string(), Some("yesterday"), None)
            .await;
        assert!(matches!(result, Err(ChatServiceError::Validation(_))));
    }

    #[test]
    fn test_listing_limit_defaults_and_clamps() {
        assert_eq!(list_limit(None), 50);
        assert_eq!(list_limit(Some(0)), 1);
        assert_eq!(list_limit(Some(-5)), 1);
        assert_eq!(list_limit(Some(20)), 20);
        assert_eq!(list_limit(Some(1000)), 100);
    }
}
