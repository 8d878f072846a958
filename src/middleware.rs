use std::{net::SocketAddr, time::Instant};

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::{errors::AppError, limits::RateLimitError, state::AppState};

/// Client address resolved once per request and shared with later layers.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// First non-empty entry of `X-Real-Ip`, then `X-Forwarded-For`, then the peer
/// address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in ["x-real-ip", "x-forwarded-for"] {
        let first = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .find(|candidate| !candidate.is_empty())
            });
        if let Some(ip) = first {
            return ip.to_owned();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Logs every request, counts it for the health endpoint and records the client IP.
pub async fn request_log(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let ip = client_ip(request.headers(), peer_addr(&request));
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    state.stats.record(path.starts_with(&state.config.api_prefix));
    request.extensions_mut().insert(ClientIp(ip.clone()));

    let response = next.run(request).await;
    info!(
        method = %method,
        path = %path,
        ip = %ip,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Rejects blocked or over-limit clients before the handler runs.
pub async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = match request.extensions().get::<ClientIp>() {
        Some(ClientIp(ip)) => ip.clone(),
        None => client_ip(request.headers(), peer_addr(&request)),
    };

    match state.rate_limiter.admit(&ip).await {
        Ok(()) => next.run(request).await,
        Err(error) => {
            let path = request
                .extensions()
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_owned())
                .unwrap_or_else(|| request.uri().path().to_owned());
            warn!(ip = %ip, path = %path, reason = error.reason(), "request rejected by admission");
            state.metrics.observe_rejection(error.reason());
            rejection_response(&error)
        }
    }
}

fn rejection_response(error: &RateLimitError) -> Response {
    let mut response = AppError::from(error).into_response();
    for (name, value) in error.header_pairs() {
        crate::errors::apply_header(response.headers_mut(), &name, &value);
    }
    response
}

pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match state.auth.authenticate(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(error) => error.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_headers_take_priority_over_peer() {
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(client_ip(&HeaderMap::new(), peer), "127.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" , 203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(&headers, peer), "198.51.100.4");
    }

    #[test]
    fn missing_peer_falls_back_to_placeholder() {
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }
}
