use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::{
    app_state::SharedState,
    http::error::AppResult,
    services::registry::{Delivery, Subscription},
};

const MIN_HEARTBEAT_SECONDS: u64 = 1;

/// Turns an observer's channel into an SSE body.
///
/// The subscription lives inside the stream, so the observer is detached
/// as soon as the client goes away and the body is dropped.
fn observer_stream(
    label: String,
    subscription: Subscription,
    receiver: mpsc::Receiver<Delivery>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let connected = stream::once(async move {
        Ok::<_, Infallible>(Event::default().comment(format!("connected to {label}")))
    });

    let deliveries = ReceiverStream::new(receiver).map(move |frame| {
        let _membership = &subscription;
        Ok::<_, Infallible>(Event::default().event(&frame.event).data(&frame.data))
    });

    connected.chain(deliveries)
}

fn keep_alive(heartbeat_seconds: u64) -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(heartbeat_seconds.max(MIN_HEARTBEAT_SECONDS)))
        .text("keep-alive")
}

#[utoipa::path(
    get,
    path = "/chat/stream/{conversation_id}",
    params(("conversation_id" = String, Path, description = "Conversation identifier")),
    responses(
        (status = 200, description = "Server-sent events: token, done, error", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Malformed conversation id", body = shared::models::ErrorResponse),
        (status = 404, description = "Conversation not found", body = shared::models::ErrorResponse)
    ),
    tag = "Streaming"
)]
pub async fn stream_conversation(
    State(state): State<SharedState>,
    Path(conversation_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (conversation_id, subscription, receiver) =
        state.chat.subscribe_conversation(&conversation_id).await?;
    info!(%conversation_id, observer = %subscription.observer(), "observer connected");

    let body = observer_stream(conversation_id.to_string(), subscription, receiver);
    Ok(Sse::new(body).keep_alive(keep_alive(state.config.stream.heartbeat_seconds)))
}

#[utoipa::path(
    get,
    path = "/conversations/stream",
    responses(
        (status = 200, description = "Server-sent events: conversation", body = String, content_type = "text/event-stream")
    ),
    tag = "Streaming"
)]
pub async fn stream_conversations(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscription, receiver) = state.chat.subscribe_all();
    debug!(observer = %subscription.observer(), "conversation list observer connected");

    let body = observer_stream(subscription.topic().to_string(), subscription, receiver);
    Sse::new(body).keep_alive(keep_alive(state.config.stream.heartbeat_seconds))
}
