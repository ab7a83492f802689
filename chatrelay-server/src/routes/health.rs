use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;

use crate::{app_state::SharedState, db::postgres};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_runs: Option<usize>,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("chatrelay_health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            active_runs: None,
        }),
    )
}

async fn readyz(State(state): State<SharedState>) -> impl IntoResponse {
    let active_runs = Some(state.chat.controller().active_runs().len());
    let ready = match state.pool.as_ref() {
        Some(pool) => postgres::ping(pool).await.is_ok(),
        None => true,
    };

    let (status, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    metrics::counter!(
        "chatrelay_health_checks_total",
        "endpoint" => "readyz",
        "status" => if ready { "ok" } else { "error" }
    )
    .increment(1);

    (
        status,
        Json(HealthResponse {
            status: label,
            active_runs,
        }),
    )
}

pub fn create_health_router() -> Router<SharedState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use axum::{body::Body, http::Request};
    use shared::config::server::{Config, Profile};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> SharedState {
        let config = Arc::new(Config::default_for_profile(Profile::Test));
        Arc::new(AppState::in_memory(config).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = create_health_router().with_state(state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_without_database_is_ready() {
        let app = create_health_router().with_state(state());
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ready");
        assert_eq!(body["activeRuns"], 0);
    }
}
