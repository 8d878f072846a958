use std::{convert::Infallible, time::Duration, time::Instant};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    blacklist::{BlacklistEntry, BlacklistStats},
    catalog,
    errors::AppError,
    models::ChatCompletionsRequest,
    state::AppState,
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    metrics: HealthMetrics,
}

#[derive(Debug, Serialize)]
struct HealthMetrics {
    total_rpm: u64,
    total_rps: u64,
    api_rpm: u64,
    api_rps: u64,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.stats.snapshot();
    Json(HealthResponse {
        status: "ok",
        metrics: HealthMetrics {
            total_rpm: snapshot.rpm,
            total_rps: snapshot.rps,
            api_rpm: snapshot.api_rpm,
            api_rps: snapshot.api_rps,
        },
    })
}

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state
        .metrics
        .observe_pools(&state.service.backend().pool_status());
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn list_models() -> impl IntoResponse {
    Json(catalog::models_response())
}

pub async fn route_not_found(uri: Uri) -> AppError {
    AppError::RouteNotFound(uri.path().to_owned())
}

#[derive(Debug, Serialize)]
struct BlacklistReport {
    entries: Vec<BlacklistEntry>,
    stats: BlacklistStats,
}

pub async fn admin_blacklist(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(error) = state.auth.authorize_admin(&headers) {
        return error.into_response();
    }
    let blacklist = state.blacklist();
    Json(BlacklistReport {
        entries: blacklist.entries().await,
        stats: blacklist.stats().await,
    })
    .into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionsRequest>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(request)) => serve_chat(state, request, "/chat/completions").await,
        Err(rejection) => AppError::BadRequest(rejection.body_text()).into_response(),
    }
}

/// Chat endpoint mounted under a model name. The path model is used when the body
/// names no model or one the catalog does not know.
pub async fn model_chat_completions(
    State(state): State<AppState>,
    Path(model): Path<String>,
    payload: Result<Json<ChatCompletionsRequest>, JsonRejection>,
) -> Response {
    if !catalog::is_supported(&model) {
        return AppError::RouteNotFound(format!("/{model}")).into_response();
    }
    let mut request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return AppError::BadRequest(rejection.body_text()).into_response(),
    };
    if request.model.is_empty() || !catalog::is_supported(&request.model) {
        request.model = model;
    }
    serve_chat(state, request, "/:model/chat/completions").await
}

async fn serve_chat(state: AppState, request: ChatCompletionsRequest, route: &str) -> Response {
    let started = Instant::now();
    let stream = request.stream;
    let _inflight = state.metrics.inflight_guard();

    info!(
        model = %request.model,
        stream,
        messages = request.messages.len(),
        "chat request accepted"
    );

    let result = if stream {
        stream_completion(state.clone(), request).await
    } else {
        one_shot_completion(&state, request).await
    };
    let response = result.unwrap_or_else(IntoResponse::into_response);

    state.metrics.observe_request(
        route,
        "POST",
        stream,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn one_shot_completion(
    state: &AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let response = state.service.complete(request).await.map_err(|error| {
        warn!(error = %error, "chat completion failed");
        error
    })?;
    info!(
        id = %response.id,
        model = %response.model,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        "chat completion served"
    );
    Ok(Json(response).into_response())
}

async fn stream_completion(
    state: AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let cancel = CancellationToken::new();
    let mut deltas = state
        .service
        .complete_stream(request, cancel.clone())
        .await?;
    let metrics = state.metrics.clone();

    let outbound = async_stream::stream! {
        // Dropping the response body, e.g. on client disconnect, stops the relay.
        let _cancel_on_drop = cancel.drop_guard();
        while let Some(next) = deltas.recv().await {
            match next {
                Ok(chunk) => yield Ok::<Event, Infallible>(json_event(chunk)),
                Err(error) => {
                    metrics.observe_backend_error("stream_relay");
                    warn!(error = %error, code = error.code().as_str(), "stream ended with error");
                    yield Ok::<Event, Infallible>(Event::default().data(error.envelope().to_string()));
                    break;
                }
            }
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response())
}

fn json_event<T: Serialize>(payload: T) -> Event {
    match serde_json::to_string(&payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = AppError::Internal(format!("serialization error: {error}"));
            Event::default().data(fallback.envelope().to_string())
        }
    }
}
