pub mod grpc;
pub mod mock;
pub mod proto;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tonic::Code;

use crate::models::{ChatCompletionsChunk, ChatCompletionsResponse};
use crate::pool::{PoolError, PoolStatus};
use crate::translate::RoutedRequest;

/// Deltas produced by one upstream stream; a successful stream always ends with a
/// terminal chunk carrying usage.
pub type DeltaStream = BoxStream<'static, Result<ChatCompletionsChunk, BackendError>>;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn execute_chat(
        &self,
        request: &RoutedRequest,
    ) -> Result<ChatCompletionsResponse, BackendError>;

    async fn stream_chat(&self, request: RoutedRequest) -> Result<DeltaStream, BackendError>;

    fn pool_status(&self) -> Vec<PoolStatus> {
        Vec::new()
    }

    async fn shutdown(&self) {}
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend call failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("connection pool timeout")]
    PoolTimeout,
    #[error("backend connection failed: {0}")]
    Connect(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("no {0} backend configured")]
    NotConfigured(&'static str),
    #[error("service error: response code {0}")]
    ServiceError(i64),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Transport-level and availability failures are worth another attempt; anything the
    /// backend actually answered (service codes, malformed payloads) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status(status) => matches!(
                status.code(),
                Code::Unavailable
                    | Code::ResourceExhausted
                    | Code::DeadlineExceeded
                    | Code::Internal
                    | Code::Unknown
                    | Code::Cancelled
            ),
            Self::Timeout(_) | Self::PoolTimeout | Self::Connect(_) | Self::Unavailable(_) => true,
            Self::NotConfigured(_) | Self::ServiceError(_) | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<PoolError> for BackendError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Timeout => Self::PoolTimeout,
            PoolError::Connect(reason) => Self::Connect(reason),
            PoolError::Closed => Self::Unavailable("connection pool is shut down".to_owned()),
        }
    }
}
