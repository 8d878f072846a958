use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::backend::BackendError;

/// Stable machine-readable error codes carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    IpBlocked,
    RouteNotFound,
    ModelNotFound,
    MethodNotAllowed,
    TooManyRequests,
    RateLimitExceeded,
    InternalError,
    ServiceUnavailable,
    GatewayTimeout,
    RequestTimeout,
    StreamTimeout,
    RequestCanceled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::IpBlocked => "ip_blocked",
            Self::RouteNotFound => "route_not_found",
            Self::ModelNotFound => "model_not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::TooManyRequests => "too_many_requests",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::InternalError => "internal_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::GatewayTimeout => "gateway_timeout",
            Self::RequestTimeout => "request_timeout",
            Self::StreamTimeout => "stream_timeout",
            Self::RequestCanceled => "request_canceled",
        }
    }

    /// Fixed code to status table; codes without an entry map to 500.
    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::RouteNotFound | Self::ModelNotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::TooManyRequests | Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout | Self::RequestTimeout | Self::StreamTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::InternalError | Self::RequestCanceled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(self) -> &'static str {
        match self {
            Self::InvalidRequest | Self::ModelNotFound | Self::RouteNotFound | Self::MethodNotAllowed => {
                "invalid_request_error"
            }
            Self::Unauthorized | Self::Forbidden => "authentication_error",
            Self::IpBlocked | Self::TooManyRequests | Self::RateLimitExceeded => "rate_limit_error",
            Self::GatewayTimeout | Self::RequestTimeout | Self::StreamTimeout => "timeout_error",
            Self::InternalError | Self::ServiceUnavailable | Self::RequestCanceled => "server_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Model '{0}' does not exist")]
    ModelNotFound(String),
    #[error("route not found: {0}")]
    RouteNotFound(String),
    #[error("IP has been blocked")]
    IpBlocked,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: BackendError },
    #[error("request timed out")]
    RequestTimeout,
    #[error("stream timed out")]
    StreamTimeout,
    #[error("request canceled")]
    Canceled,
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: String,
    #[serde(rename = "type")]
    error_type: &'a str,
    code: &'a str,
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::InvalidRequest,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::ModelNotFound(_) => ErrorCode::ModelNotFound,
            Self::RouteNotFound(_) => ErrorCode::RouteNotFound,
            Self::IpBlocked => ErrorCode::IpBlocked,
            Self::RateLimited => ErrorCode::RateLimitExceeded,
            Self::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            Self::Backend(BackendError::PoolTimeout) => ErrorCode::ServiceUnavailable,
            Self::Backend(_) => ErrorCode::InternalError,
            Self::RetriesExhausted { last, .. } => match last {
                BackendError::PoolTimeout => ErrorCode::ServiceUnavailable,
                _ => ErrorCode::InternalError,
            },
            Self::RequestTimeout => ErrorCode::RequestTimeout,
            Self::StreamTimeout => ErrorCode::StreamTimeout,
            Self::Canceled => ErrorCode::RequestCanceled,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// JSON envelope `{error:{message,type,code}}`, shared by HTTP error responses and
    /// inline stream error events.
    pub fn envelope(&self) -> serde_json::Value {
        let code = self.code();
        let payload = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: code.error_type(),
                code: code.as_str(),
            },
        };
        serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.code().status(), Json(self.envelope())).into_response()
    }
}

pub fn apply_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_matches_codes() {
        assert_eq!(ErrorCode::RateLimitExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::IpBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::ModelNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::RequestCanceled.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn pool_exhaustion_surfaces_as_service_unavailable() {
        let error = AppError::RetriesExhausted {
            attempts: 3,
            last: BackendError::PoolTimeout,
        };
        assert_eq!(error.code(), ErrorCode::ServiceUnavailable);

        let error = AppError::RetriesExhausted {
            attempts: 3,
            last: BackendError::InvalidResponse("x".to_owned()),
        };
        assert_eq!(error.code(), ErrorCode::InternalError);
    }

    #[test]
    fn envelope_carries_code_and_type() {
        let envelope = AppError::RateLimited.envelope();
        assert_eq!(envelope["error"]["code"], "rate_limit_exceeded");
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
        assert_eq!(envelope["error"]["message"], "Rate limit exceeded");
    }
}
