use axum::{Json, Router, routing::get};
use utoipa::OpenApi;

use crate::{app_state::SharedState, openapi::ApiDoc};

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn openapi_routes() -> Router<SharedState> {
    Router::new().route("/openapi.json", get(openapi_json))
}
