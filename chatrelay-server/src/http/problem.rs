use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

const PROBLEM_TYPE_BASE: &str = "https://chatrelay.dev/problems";

/// Seconds a client should wait before re-posting into a conversation
/// whose reply is still streaming.
const STREAM_RETRY_AFTER_SECONDS: &str = "1";

/// Machine-readable failure kinds of the chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemCode {
    ValidationFailed,
    ConversationNotFound,
    StreamInProgress,
    StorageFailure,
    Internal,
}

impl ProblemCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::ConversationNotFound => "not_found",
            Self::StreamInProgress => "stream_in_progress",
            Self::StorageFailure => "storage_error",
            Self::Internal => "internal_error",
        }
    }

    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::ConversationNotFound => StatusCode::NOT_FOUND,
            Self::StreamInProgress => StatusCode::CONFLICT,
            Self::StorageFailure | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn title(self) -> &'static str {
        match self {
            Self::ValidationFailed => "Invalid chat request",
            Self::ConversationNotFound => "Conversation not found",
            Self::StreamInProgress => "Reply already streaming",
            Self::StorageFailure => "Conversation storage unavailable",
            Self::Internal => "Internal error",
        }
    }
}

/// RFC 7807 error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub code: String,
    pub message: String,
    /// Conversation the problem refers to, as `/conversations/{id}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip)]
    retry_after: Option<&'static str>,
}

impl ProblemDetails {
    pub fn new(code: ProblemCode, message: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{PROBLEM_TYPE_BASE}/{}", code.as_str()),
            title: code.title().to_string(),
            status: code.status().as_u16(),
            code: code.as_str().to_string(),
            message: message.into(),
            instance: None,
            details: None,
            retry_after: (code == ProblemCode::StreamInProgress)
                .then_some(STREAM_RETRY_AFTER_SECONDS),
        }
    }

    #[must_use]
    pub fn for_conversation(mut self, conversation_id: Uuid) -> Self {
        self.instance = Some(format!("/conversations/{conversation_id}"));
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after;
        let mut response = (status, axum::Json(self)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(seconds) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_conflict_carries_retry_hint_and_instance() {
        let id = Uuid::new_v4();
        let response = ProblemDetails::new(ProblemCode::StreamInProgress, "busy")
            .for_conversation(id)
            .into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
    }

    #[test]
    fn test_problem_body_uses_chat_titles() {
        let id = Uuid::new_v4();
        let problem =
            ProblemDetails::new(ProblemCode::ConversationNotFound, "gone").for_conversation(id);
        let value = serde_json::to_value(&problem).unwrap();

        assert_eq!(value["title"], "Conversation not found");
        assert_eq!(value["type"], "https://chatrelay.dev/problems/not_found");
        assert_eq!(value["instance"], format!("/conversations/{id}"));
        assert!(value.get("retry_after").is_none());

        let response = ProblemDetails::new(ProblemCode::ValidationFailed, "bad").into_response();
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
