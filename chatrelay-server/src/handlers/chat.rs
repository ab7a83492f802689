use std::num::IntErrorKind;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use shared::models::{ChatAccepted, ChatRequest, ConversationSummary, ErrorResponse, MessagesPage};
use tracing::{info, instrument};
use utoipa::IntoParams;

use crate::{
    app_state::SharedState,
    http::error::{ApiError, AppResult},
};

/// Query string of `GET /chat/{conversationId}`.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct PageQuery {
    /// Cursor returned as `nextCursor` by the previous page.
    pub before: Option<String>,
    /// Page size, clamped to the configured bounds.
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Number of conversations, clamped to `[1, 100]`; defaults to 50.
    pub limit: Option<String>,
}

/// Parses a numeric limit. Out-of-range numbers saturate so the pager can
/// clamp them; only non-numeric text is rejected.
fn parse_limit(raw: Option<&str>) -> AppResult<Option<i64>> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| match value.parse::<i64>() {
            Ok(limit) => Ok(limit),
            Err(err) => match err.kind() {
                IntErrorKind::PosOverflow => Ok(i64::MAX),
                IntErrorKind::NegOverflow => Ok(i64::MIN),
                _ => Err(ApiError::bad_request(format!("invalid limit '{value}'"))),
            },
        })
        .transpose()
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Reply streaming started", body = ChatAccepted),
        (status = 400, description = "Invalid input or conversation id", body = ErrorResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse),
        (status = 409, description = "A reply is already streaming", body = ErrorResponse)
    ),
    tag = "Chat"
)]
#[instrument(skip(state, request))]
pub async fn post_chat(
    State(state): State<SharedState>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Json<ChatAccepted>> {
    let accepted = state.chat.post_chat(request).await?;
    info!(conversation_id = %accepted.conversation_id, "chat accepted");
    Ok(Json(accepted))
}

#[utoipa::path(
    get,
    path = "/chat/{conversation_id}",
    params(
        ("conversation_id" = String, Path, description = "Conversation identifier"),
        PageQuery
    ),
    responses(
        (status = 200, description = "One page of history, oldest first", body = MessagesPage),
        (status = 400, description = "Malformed id, cursor or limit", body = ErrorResponse),
        (status = 404, description = "Conversation not found", body = ErrorResponse)
    ),
    tag = "Chat"
)]
#[instrument(skip(state))]
pub async fn get_conversation_page(
    State(state): State<SharedState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<MessagesPage>> {
    let limit = parse_limit(query.limit.as_deref())?;
    let page = state
        .chat
        .get_page(&conversation_id, query.before.as_deref(), limit)
        .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/conversations",
    params(ListQuery),
    responses(
        (status = 200, description = "Conversations, most recently updated first", body = [ConversationSummary]),
        (status = 400, description = "Malformed limit", body = ErrorResponse)
    ),
    tag = "Chat"
)]
#[instrument(skip(state))]
pub async fn list_conversations(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let limit = parse_limit(query.limit.as_deref())?;
    Ok(Json(state.chat.list_conversations(limit).await?))
}
