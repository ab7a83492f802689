pub mod conversation;
pub mod message;
pub mod pagination;
pub mod streaming;
pub mod timestamp;

pub use conversation::{Conversation, ConversationSummary, LastMessage};
pub use message::{Message, MessageRole};
pub use pagination::{CursorError, MessagesPage, PageCursor};
pub use streaming::{SseFrame, SseFrameParser, StreamEvent, StreamEventError};
pub use timestamp::Timestamp;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Body of `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Existing conversation to continue; a new one is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub input: String,
}

/// Acknowledgement returned once a run has been started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatAccepted {
    pub conversation_id: Uuid,
    pub status: String,
}

/// Error body returned by the API (RFC 7807 subset).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
