#![allow(clippy::needless_for_each)] // Derive macro emits a for_each internally

use shared::models::{
    ChatAccepted, ChatRequest, Conversation, ConversationSummary, ErrorResponse, LastMessage,
    Message, MessageRole, MessagesPage, PageCursor, Timestamp,
    streaming::{ConversationEventPayload, DonePayload, ErrorPayload, TokenPayload},
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChatRelay API",
        version = "0.1.0",
        description = "Chat replies streamed to live observers, with cursor-paged history"
    ),
    paths(
        crate::handlers::chat::post_chat,
        crate::handlers::chat::get_conversation_page,
        crate::handlers::chat::list_conversations,
        crate::handlers::streaming::stream_conversation,
        crate::handlers::streaming::stream_conversations,
    ),
    components(
        schemas(
            ChatRequest,
            ChatAccepted,
            Conversation,
            ConversationSummary,
            LastMessage,
            Message,
            MessageRole,
            MessagesPage,
            PageCursor,
            Timestamp,
            ErrorResponse,
            TokenPayload,
            DonePayload,
            ErrorPayload,
            ConversationEventPayload,
        )
    ),
    tags(
        (name = "Chat", description = "Sending messages and reading history"),
        (name = "Streaming", description = "Server-sent event subscriptions")
    )
)]
pub struct ApiDoc;
