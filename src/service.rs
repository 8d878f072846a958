use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DeltaStream, InferenceBackend};
use crate::config::GatewayConfig;
use crate::errors::AppError;
use crate::metrics::AppMetrics;
use crate::models::{ChatCompletionsChunk, ChatCompletionsRequest, ChatCompletionsResponse};
use crate::translate::{self, RoutedRequest};

const STREAM_BUFFER: usize = 32;
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub default_model: Option<String>,
}

impl From<&GatewayConfig> for ServiceConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            request_timeout: config.request_timeout,
            stream_timeout: config.stream_timeout,
            default_model: config.default_model.clone(),
        }
    }
}

pub type DeltaReceiver = mpsc::Receiver<Result<ChatCompletionsChunk, AppError>>;

/// Drives chat requests through routing, the backend and the retry policy.
pub struct ChatService {
    backend: Arc<dyn InferenceBackend>,
    config: ServiceConfig,
    metrics: Arc<AppMetrics>,
}

/// Delay before retry number `attempt + 1`: 1s, 2s, 4s, ...
pub fn backoff_for(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(MAX_BACKOFF_EXPONENT))
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: ServiceConfig,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            backend,
            config,
            metrics,
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// Unary completion with retries, bounded overall by the request timeout.
    pub async fn complete(
        &self,
        request: ChatCompletionsRequest,
    ) -> Result<ChatCompletionsResponse, AppError> {
        let routed = translate::resolve(request, self.config.default_model.as_deref())?;
        let deadline = Instant::now() + self.config.request_timeout;

        match timeout_at(deadline, self.complete_with_retries(&routed, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    model = %routed.model,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "request deadline exceeded"
                );
                Err(AppError::RequestTimeout)
            }
        }
    }

    async fn complete_with_retries(
        &self,
        routed: &RoutedRequest,
        deadline: Instant,
    ) -> Result<ChatCompletionsResponse, AppError> {
        let attempts = self.config.max_retries.max(1);
        let family = routed.family.as_str();
        let mut last_error = None;

        for attempt in 0..attempts {
            let error = match self.backend.execute_chat(routed).await {
                Ok(response) => {
                    self.metrics.observe_usage(&response.usage);
                    return Ok(response);
                }
                Err(error) => error,
            };

            self.metrics.observe_backend_error("unary");
            if !error.is_retryable() {
                warn!(model = %routed.model, error = %error, "backend call failed");
                return Err(AppError::Backend(error));
            }

            let remaining_attempts = attempts - attempt - 1;
            warn!(
                model = %routed.model,
                attempt = attempt + 1,
                remaining_attempts,
                error = %error,
                "retryable backend failure"
            );
            last_error = Some(error);
            if remaining_attempts == 0 {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AppError::RequestTimeout);
            }
            let backoff = backoff_for(attempt).min(remaining);
            self.metrics.observe_retry(family);
            debug!(backoff_ms = backoff.as_millis() as u64, "backing off before retry");
            sleep(backoff).await;
        }

        Err(AppError::RetriesExhausted {
            attempts,
            last: last_error
                .unwrap_or_else(|| BackendError::Unavailable("no attempt was made".to_owned())),
        })
    }

    /// Opens a backend stream and relays its deltas through a bounded channel.
    ///
    /// Failures before the stream opens are returned directly. Once deltas flow, a
    /// failure is delivered as the final item and the channel closes. Cancelling
    /// `cancel` or dropping the receiver stops the relay and releases the backend
    /// connection.
    pub async fn complete_stream(
        &self,
        request: ChatCompletionsRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaReceiver, AppError> {
        let routed = translate::resolve(request, self.config.default_model.as_deref())?;
        let deadline = Instant::now() + self.config.stream_timeout;
        let model = routed.model.clone();

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Canceled),
            opened = timeout_at(deadline, self.backend.stream_chat(routed)) => opened,
        };
        let upstream = match opened {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(error)) => {
                self.metrics.observe_backend_error("stream_open");
                warn!(model = %model, error = %error, "failed to open backend stream");
                return Err(AppError::Backend(error));
            }
            Err(_) => return Err(AppError::StreamTimeout),
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        info!(model = %model, "stream opened");
        tokio::spawn(relay(upstream, tx, cancel, deadline, self.metrics.clone()));
        Ok(rx)
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

async fn relay(
    mut upstream: DeltaStream,
    tx: mpsc::Sender<Result<ChatCompletionsChunk, AppError>>,
    cancel: CancellationToken,
    deadline: Instant,
    metrics: Arc<AppMetrics>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("stream canceled by caller");
                return;
            }
            _ = sleep_until(deadline) => {
                warn!("stream deadline exceeded");
                let _ = tx.try_send(Err(AppError::StreamTimeout));
                return;
            }
            next = upstream.next() => next,
        };

        let item = match next {
            None => return,
            Some(Ok(delta)) => {
                if let Some(usage) = delta.usage.as_ref().filter(|_| delta.is_terminal()) {
                    metrics.observe_usage(usage);
                }
                Ok(delta)
            }
            Some(Err(error)) => {
                metrics.observe_backend_error("stream");
                warn!(error = %error, "backend stream failed");
                Err(AppError::Backend(error))
            }
        };
        let failed = item.is_err();

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = sleep_until(deadline) => {
                warn!("stream deadline exceeded while delivering");
                false
            }
            sent = tx.send(item) => sent.is_ok(),
        };
        if !delivered || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::models::{ChatMessage, MessageRole};

    fn request(model: &str) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: model.to_owned(),
            messages: vec![ChatMessage::new(MessageRole::User, "hello")],
            stream: false,
            temperature: None,
            top_p: None,
        }
    }

    fn service(backend: Arc<MockBackend>, max_retries: u32) -> ChatService {
        ChatService::new(
            backend,
            ServiceConfig {
                max_retries,
                request_timeout: Duration::from_secs(30),
                stream_timeout: Duration::from_secs(300),
                default_model: None,
            },
            Arc::new(AppMetrics::new()),
        )
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(2), Duration::from_secs(4));
        assert_eq!(backoff_for(99), Duration::from_secs(1 << 16));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_unavailable_waits_one_second() {
        let backend = Arc::new(MockBackend::default());
        backend
            .fail_next(BackendError::Status(tonic::Status::unavailable("down")))
            .await;
        let service = service(backend.clone(), 3);

        let started = Instant::now();
        let response = service.complete(request("gpt-4o")).await.expect("recovers");
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(backend.calls(), 2);
        assert_eq!(response.model, "gpt-4o");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_next(BackendError::ServiceError(500)).await;
        let service = service(backend.clone(), 3);

        let error = service.complete(request("gpt-4o")).await.expect_err("fails");
        assert!(matches!(error, AppError::Backend(BackendError::ServiceError(500))));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_family_fails_on_first_attempt() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_next(BackendError::NotConfigured("vertex")).await;
        let service = service(backend.clone(), 3);

        let started = Instant::now();
        let error = service
            .complete(request("gemini-pro"))
            .await
            .expect_err("no vertex backend");
        assert!(matches!(
            error,
            AppError::Backend(BackendError::NotConfigured("vertex"))
        ));
        assert_eq!(backend.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_last_error() {
        let backend = Arc::new(MockBackend::default());
        for _ in 0..3 {
            backend.fail_next(BackendError::PoolTimeout).await;
        }
        let service = service(backend.clone(), 3);

        let started = Instant::now();
        let error = service.complete(request("gpt-4o")).await.expect_err("fails");
        assert!(matches!(
            error,
            AppError::RetriesExhausted {
                attempts: 3,
                last: BackendError::PoolTimeout
            }
        ));
        assert_eq!(backend.calls(), 3);
        // backoffs of 1s and 2s; no sleep after the final attempt
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_total_time() {
        let backend = Arc::new(MockBackend::default());
        for _ in 0..10 {
            backend
                .fail_next(BackendError::Status(tonic::Status::unavailable("down")))
                .await;
        }
        let service = ChatService::new(
            backend,
            ServiceConfig {
                max_retries: 10,
                request_timeout: Duration::from_secs(5),
                stream_timeout: Duration::from_secs(300),
                default_model: None,
            },
            Arc::new(AppMetrics::new()),
        );

        let started = Instant::now();
        let error = service.complete(request("gpt-4o")).await.expect_err("times out");
        assert!(matches!(error, AppError::RequestTimeout));
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unknown_model_fails_before_backend() {
        let backend = Arc::new(MockBackend::default());
        let service = service(backend.clone(), 3);
        let error = service.complete(request("gpt-5")).await.expect_err("unknown");
        assert!(matches!(error, AppError::ModelNotFound(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn stream_relays_until_terminal() {
        let backend = Arc::new(MockBackend::default().with_token_delay(Duration::ZERO));
        let service = service(backend, 3);
        let mut rx = service
            .complete_stream(request("claude-3-haiku-20240307"), CancellationToken::new())
            .await
            .expect("opens");

        let mut deltas = Vec::new();
        while let Some(item) = rx.recv().await {
            deltas.push(item.expect("delta"));
        }
        assert!(deltas.last().expect("non-empty").is_terminal());
        assert_eq!(deltas.iter().filter(|delta| delta.is_terminal()).count(), 1);
        assert!(deltas
            .iter()
            .all(|delta| delta.model == "claude-3-haiku-20240307"));
    }

    #[tokio::test]
    async fn stream_open_failure_is_returned_directly() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_next(BackendError::PoolTimeout).await;
        let service = service(backend, 3);
        let error = service
            .complete_stream(request("gpt-4o"), CancellationToken::new())
            .await
            .expect_err("pool exhausted");
        assert_eq!(error.code(), crate::errors::ErrorCode::ServiceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_relay() {
        let backend =
            Arc::new(MockBackend::default().with_token_delay(Duration::from_secs(1)));
        let service = service(backend, 3);
        let cancel = CancellationToken::new();
        let mut rx = service
            .complete_stream(request("gpt-4o"), cancel.clone())
            .await
            .expect("opens");

        let first = rx.recv().await.expect("first delta").expect("ok");
        assert!(!first.is_terminal());
        cancel.cancel();
        let mut remaining = 0;
        while let Some(item) = rx.recv().await {
            assert!(item.is_ok());
            remaining += 1;
        }
        assert!(remaining <= STREAM_BUFFER);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_deadline_emits_timeout() {
        let backend =
            Arc::new(MockBackend::default().with_token_delay(Duration::from_secs(10)));
        let service = ChatService::new(
            backend,
            ServiceConfig {
                max_retries: 1,
                request_timeout: Duration::from_secs(30),
                stream_timeout: Duration::from_secs(5),
                default_model: None,
            },
            Arc::new(AppMetrics::new()),
        );
        let mut rx = service
            .complete_stream(request("gpt-4o"), CancellationToken::new())
            .await
            .expect("opens");

        let mut last = None;
        while let Some(item) = rx.recv().await {
            last = Some(item);
        }
        assert!(matches!(last, Some(Err(AppError::StreamTimeout))));
    }
}
