use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use super::problem::{ProblemCode, ProblemDetails};
use crate::services::{chat_service::ChatServiceError, store::StoreError};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct ApiError {
    code: ProblemCode,
    message: String,
    conversation_id: Option<Uuid>,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ProblemCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            conversation_id: None,
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ProblemCode::ValidationFailed, message)
    }

    pub fn conversation_not_found(conversation_id: Uuid) -> Self {
        Self::new(
            ProblemCode::ConversationNotFound,
            format!("conversation {conversation_id} not found"),
        )
        .for_conversation(conversation_id)
    }

    pub fn stream_in_progress(conversation_id: Uuid) -> Self {
        Self::new(
            ProblemCode::StreamInProgress,
            format!("a reply is already streaming for conversation {conversation_id}"),
        )
        .for_conversation(conversation_id)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(ProblemCode::Internal, message)
    }

    #[must_use]
    pub fn for_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub const fn code(&self) -> ProblemCode {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status().is_server_error() {
            error!(code = self.code.as_str(), message = %self.message, "request failed");
        }

        let mut problem = ProblemDetails::new(self.code, self.message);
        if let Some(conversation_id) = self.conversation_id {
            problem = problem.for_conversation(conversation_id);
        }
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or(std::borrow::Cow::Borrowed("unknown"));
            return Self::new(ProblemCode::StorageFailure, format!("database error {code}"))
                .with_details(json!({ "sqlstate": code, "message": db_err.message() }));
        }

        Self::new(ProblemCode::StorageFailure, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::conversation_not_found(id),
            StoreError::Database(db_err) => Self::from(db_err),
        }
    }
}

impl From<ChatServiceError> for ApiError {
    fn from(err: ChatServiceError) -> Self {
        match err {
            ChatServiceError::Validation(message) => Self::bad_request(message),
            ChatServiceError::NotFound(id) => Self::conversation_not_found(id),
            ChatServiceError::Conflict(id) => Self::stream_in_progress(id),
            ChatServiceError::Store(store) => Self::from(store),
            ChatServiceError::Run(run) => Self::internal_server_error(run.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_into_response_serializes_problem_details() {
        let id = Uuid::new_v4();
        let response = ApiError::conversation_not_found(id)
            .with_details(json!({ "requested": "abc" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .expect("body to bytes");
        let json: Value = serde_json::from_slice(&bytes).expect("problem json");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["status"], 404);
        assert_eq!(json["message"], format!("conversation {id} not found"));
        assert_eq!(json["instance"], format!("/conversations/{id}"));
        assert_eq!(json["details"]["requested"], "abc");
    }

    #[test]
    fn test_chat_service_errors_map_to_matching_status_codes() {
        let id = Uuid::new_v4();

        let validation = ApiError::from(ChatServiceError::Validation("bad".into()));
        assert_eq!(validation.status(), StatusCode::BAD_REQUEST);

        let not_found = ApiError::from(ChatServiceError::NotFound(id));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict = ApiError::from(ChatServiceError::Conflict(id));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.code(), ProblemCode::StreamInProgress);

        let db = ApiError::from(ChatServiceError::Store(StoreError::Database(
            sqlx::Error::PoolTimedOut,
        )));
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(db.code(), ProblemCode::StorageFailure);
    }

    #[test]
    fn test_store_not_found_is_404() {
        let err = ApiError::from(StoreError::NotFound(Uuid::nil()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
