use axum::{body::Body, http::Request};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnEos, DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{Level, Span, debug, error};

use crate::middleware::request_context::RequestContext;

type TraceLayerType = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    fn(&Request<Body>, &Span),
    DefaultOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    fn(ServerErrorsFailureClass, Duration, &Span),
>;

/// Which part of the chat surface a request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChatRoute<'a> {
    Post,
    Page(&'a str),
    ConversationStream(&'a str),
    List,
    ListStream,
    Other,
}

impl<'a> ChatRoute<'a> {
    pub(crate) fn classify(path: &'a str) -> Self {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match *segments.as_slice() {
            ["chat"] => Self::Post,
            ["chat", "stream", id] => Self::ConversationStream(id),
            ["chat", id] => Self::Page(id),
            ["conversations"] => Self::List,
            ["conversations", "stream"] => Self::ListStream,
            _ => Self::Other,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Post => "chat.post",
            Self::Page(_) => "chat.page",
            Self::ConversationStream(_) => "chat.stream",
            Self::List => "conversations.list",
            Self::ListStream => "conversations.stream",
            Self::Other => "other",
        }
    }

    const fn conversation_id(self) -> Option<&'a str> {
        match self {
            Self::Page(id) | Self::ConversationStream(id) => Some(id),
            _ => None,
        }
    }

    const fn is_stream(self) -> bool {
        matches!(self, Self::ConversationStream(_) | Self::ListStream)
    }
}

/// Span factory tagging each request with its id, chat route and
/// conversation.
#[derive(Clone, Debug, Default)]
pub(crate) struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestContext>()
            .map_or_else(|| "n/a".to_string(), |ctx| ctx.request_id.clone());
        let route = ChatRoute::classify(request.uri().path());

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            route = route.label(),
            conversation_id = route.conversation_id().unwrap_or("-"),
        )
    }
}

pub(crate) fn on_request_handler(req: &Request<Body>, span: &Span) {
    let route = ChatRoute::classify(req.uri().path());
    span.in_scope(|| {
        if route.is_stream() {
            debug!(route = route.label(), "observer stream requested");
        } else {
            debug!(
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
                "started processing request"
            );
        }
    });
}

pub(crate) fn on_failure_handler(error: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| {
        error!(error = %error, latency = ?latency, "error processing request");
    });
}

/// HTTP request logging layer.
pub fn create_trace_layer() -> TraceLayerType {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request_handler as fn(&Request<Body>, &Span))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(on_failure_handler as fn(ServerErrorsFailureClass, Duration, &Span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn test_span_carries_request_id_from_context() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .set_default();

        let mut request = Request::builder()
            .method(Method::GET)
            .uri("/chat/stream/abc")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(RequestContext {
            request_id: "req-7".into(),
        });

        let span = HttpMakeSpan.make_span(&request);
        assert_eq!(span.metadata().map(|meta| meta.name()), Some("http_request"));
        on_request_handler(&request, &span);
    }

    #[test]
    fn test_chat_routes_are_classified() {
        assert_eq!(ChatRoute::classify("/chat"), ChatRoute::Post);
        assert_eq!(ChatRoute::classify("/chat/abc"), ChatRoute::Page("abc"));
        assert_eq!(
            ChatRoute::classify("/chat/stream/abc"),
            ChatRoute::ConversationStream("abc")
        );
        assert_eq!(ChatRoute::classify("/conversations/"), ChatRoute::List);
        assert_eq!(ChatRoute::classify("/conversations/stream"), ChatRoute::ListStream);
        assert_eq!(ChatRoute::classify("/healthz"), ChatRoute::Other);

        let stream = ChatRoute::classify("/chat/stream/abc");
        assert!(stream.is_stream());
        assert_eq!(stream.conversation_id(), Some("abc"));
        assert_eq!(stream.label(), "chat.stream");
        assert_eq!(ChatRoute::classify("/conversations").conversation_id(), None);
    }

    #[test]
    fn test_failure_handler_logs_without_panicking() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::ERROR)
            .set_default();

        let span = tracing::info_span!("failing");
        on_failure_handler(
            ServerErrorsFailureClass::StatusCode(StatusCode::INTERNAL_SERVER_ERROR),
            Duration::from_millis(3),
            &span,
        );
        assert!(std::mem::size_of_val(&create_trace_layer()) > 0);
    }
}
