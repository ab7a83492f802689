use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    app_state::SharedState,
    handlers::{chat, streaming},
};

/// Chat, history, listing and live-stream routes.
pub fn create_router_chat() -> Router<SharedState> {
    Router::new()
        .route("/chat", post(chat::post_chat))
        .route("/chat/stream/{conversation_id}", get(streaming::stream_conversation))
        .route("/chat/{conversation_id}", get(chat::get_conversation_page))
        .route("/conversations", get(chat::list_conversations))
        .route("/conversations/stream", get(streaming::stream_conversations))
}
