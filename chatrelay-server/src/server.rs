use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, LogFormat};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::{AppState, SharedState},
    db::postgres::{self, PgConversationStore},
    middleware::request_context::{self, RequestIdState},
    routes,
    services::{InMemoryConversationStore, SharedStore, generator},
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder once per process and returns its handle.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            match builder.install_recorder() {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(error = %err, "metrics recorder already installed; using a detached one");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            }
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the global tracing subscriber. Returns the configured level.
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// CORS layer built from `server.cors`. An empty origin list allows any
/// origin without credentials.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors_config = &config.server.cors;
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]))
        .max_age(Duration::from_secs(cors_config.max_age_seconds));

    if cors_config.allowed_origins.is_empty() {
        return cors
            .allow_origin(AllowOrigin::any())
            .allow_headers(AllowHeaders::any());
    }

    let origins = cors_config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    let request_id = HeaderName::from_bytes(config.server.request_id_header.as_bytes())
        .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));

    cors.allow_origin(AllowOrigin::list(origins))
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::CACHE_CONTROL,
            request_id,
        ]))
        .allow_credentials(cors_config.allow_credentials)
}

/// Builds the full application router.
pub fn create_app_router(state: SharedState, metrics_handle: PrometheusHandle) -> Router {
    let cors = create_cors_layer(&state.config);
    let request_id_state = RequestIdState::from_config(&state.config);

    Router::new()
        .merge(routes::chat::create_router_chat())
        .merge(routes::health::create_health_router())
        .merge(routes::openapi::openapi_routes())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves the store and generator from `config` and wires the state.
///
/// # Errors
/// Returns an error if the database is unreachable, its schema cannot be
/// ensured, or the generator is misconfigured.
pub async fn build_state(config: Arc<Config>) -> anyhow::Result<SharedState> {
    let generator = generator::from_config(&config.generator)?;

    let (store, pool) = if config.db.url.is_some() {
        let pool = postgres::create_pool(&config.db).await?;
        postgres::ensure_schema(&pool).await?;
        info!("using postgres conversation store");
        let store: SharedStore = Arc::new(PgConversationStore::new(pool.clone()));
        (store, Some(pool))
    } else {
        info!("using in-memory conversation store");
        let store: SharedStore = Arc::new(InMemoryConversationStore::new());
        (store, None)
    };

    Ok(Arc::new(AppState::new(config, store, generator, pool)))
}

/// Resolves when the process receives Ctrl+C.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the server and serves until shutdown.
///
/// # Errors
/// Returns an error if the state cannot be built or the listener cannot bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let state = build_state(Arc::clone(&config)).await?;
    info!(generator = state.chat.controller().generator_name(), "reply generator ready");
    let app = create_app_router(state, metrics_handle);

    let host: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(host, config.server.port);
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    Ok(())
}
