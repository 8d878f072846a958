use std::sync::Arc;

use crate::{
    auth::ApiKeyRegistry,
    backend::InferenceBackend,
    blacklist::BlacklistManager,
    config::GatewayConfig,
    limits::RateLimiter,
    metrics::{AppMetrics, RequestStats},
    service::{ChatService, ServiceConfig},
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub auth: Arc<ApiKeyRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<AppMetrics>,
    pub stats: Arc<RequestStats>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Wires the service and admission layers around `backend`. Background tasks are
    /// not started here.
    pub async fn new<B>(config: GatewayConfig, backend: Arc<B>) -> Self
    where
        B: InferenceBackend + 'static,
    {
        let backend: Arc<dyn InferenceBackend> = backend;
        let metrics = Arc::new(AppMetrics::new());
        let blacklist = Arc::new(BlacklistManager::open(&config.admission).await);
        let rate_limiter = Arc::new(RateLimiter::new(&config.admission, blacklist));
        let service = Arc::new(ChatService::new(
            backend,
            ServiceConfig::from(&config),
            metrics.clone(),
        ));

        Self {
            service,
            auth: Arc::new(ApiKeyRegistry::from_config(&config)),
            rate_limiter,
            metrics,
            stats: Arc::new(RequestStats::default()),
            config: Arc::new(config),
        }
    }

    pub fn blacklist(&self) -> &Arc<BlacklistManager> {
        self.rate_limiter.blacklist()
    }
}
