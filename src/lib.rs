pub mod auth;
pub mod backend;
pub mod blacklist;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pool;
pub mod service;
pub mod state;
pub mod tokenizer;
pub mod translate;

use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use backend::{grpc::GrpcBackend, mock::MockBackend};
use config::GatewayConfig;
use tokenizer::{TiktokenCounter, TokenCounter};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const VISITOR_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const VIOLATION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Builds the shared state and starts the background tasks: pool autoscalers, admission
/// sweeps and request-rate ticks. `mock_backend` swaps the gRPC services for the mock.
pub async fn build_state(config: GatewayConfig) -> Result<state::AppState, std::io::Error> {
    let state = if config.mock_backend {
        warn!("MOCK_BACKEND is set, serving from the mock backend");
        state::AppState::new(config, Arc::new(MockBackend::named("mock"))).await
    } else {
        let tokens: Arc<dyn TokenCounter> =
            Arc::new(TiktokenCounter::new().map_err(std::io::Error::other)?);
        let backend = GrpcBackend::connect(&config, tokens)
            .await
            .map_err(std::io::Error::other)?;
        backend.spawn_autoscalers(config.pool.scale_interval);
        state::AppState::new(config, Arc::new(backend)).await
    };

    state
        .rate_limiter
        .clone()
        .spawn_sweeper(VISITOR_SWEEP_INTERVAL);
    state
        .blacklist()
        .clone()
        .spawn_sweeper(VIOLATION_SWEEP_INTERVAL);
    state.stats.clone().spawn_reset_ticks();

    info!(
        backend = state.service.backend().name(),
        prefix = %state.config.api_prefix,
        model_routes = state.config.enable_model_route,
        "gateway state ready"
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    let prefix = state.config.api_prefix.clone();

    let api = protect(
        &state,
        Router::new()
            .route("/models", get(handlers::list_models))
            .route("/chat/completions", post(handlers::chat_completions)),
    );

    let mut app = Router::new()
        .route("/", get(handlers::health))
        .route("/ping", get(handlers::ping))
        .route("/metrics", get(handlers::metrics))
        .route("/admin/blacklist", get(handlers::admin_blacklist));
    app = if prefix == "/" {
        app.merge(api)
    } else {
        app.nest(&prefix, api)
    };

    if state.config.enable_model_route {
        let path = if prefix == "/" {
            "/:model/chat/completions".to_owned()
        } else {
            format!("/:model{prefix}/chat/completions")
        };
        app = app.merge(protect(
            &state,
            Router::new().route(&path, post(handlers::model_chat_completions)),
        ));
    }

    app.fallback(handlers::route_not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_log,
        ))
        .layer(cors_layer())
        .with_state(state)
}

/// Admission runs before the API key check.
fn protect(
    state: &state::AppState,
    router: Router<state::AppState>,
) -> Router<state::AppState> {
    router
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admission,
        ))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
