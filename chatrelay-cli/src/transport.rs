//! Event-source transport and history access used by the observer session.

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use shared::models::{ConversationSummary, MessagesPage, PageCursor, SseFrameParser, StreamEvent, StreamEventError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{ApiClient, ObservedTopic};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("undecodable event: {0}")]
    Decode(#[from] StreamEventError),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// Opens live event streams. Dropping the returned stream closes the
/// connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, topic: ObservedTopic) -> Result<EventStream, TransportError>;
}

/// Reads persisted history.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<&PageCursor>,
        limit: Option<i64>,
    ) -> anyhow::Result<MessagesPage>;

    async fn conversations(&self, limit: Option<i64>) -> anyhow::Result<Vec<ConversationSummary>>;
}

#[async_trait]
impl Transport for ApiClient {
    async fn connect(&self, topic: ObservedTopic) -> Result<EventStream, TransportError> {
        let response = self
            .open_stream(topic)
            .await
            .map_err(|err| TransportError::Connect(format!("{err:#}")))?;
        debug!(?topic, "event stream open");

        let mut bytes = response.bytes_stream();
        let events = stream! {
            let mut parser = SseFrameParser::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(TransportError::Interrupted(err.to_string()));
                        return;
                    }
                };
                for frame in parser.push_bytes(&chunk) {
                    match StreamEvent::from_frame(&frame) {
                        Ok(event) => yield Ok(event),
                        Err(StreamEventError::UnknownKind(kind)) => {
                            warn!(%kind, "skipping unknown event kind");
                        }
                        Err(err) => yield Err(TransportError::Decode(err)),
                    }
                }
            }
        };
        Ok(Box::pin(events))
    }
}

#[async_trait]
impl HistoryClient for ApiClient {
    async fn page(
        &self,
        conversation_id: Uuid,
        before: Option<&PageCursor>,
        limit: Option<i64>,
    ) -> anyhow::Result<MessagesPage> {
        self.get_page(conversation_id, before, limit).await
    }

    async fn conversations(&self, limit: Option<i64>) -> anyhow::Result<Vec<ConversationSummary>> {
        self.list_conversations(limit).await
    }
}
