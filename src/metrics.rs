use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::models::Usage;
use crate::pool::PoolStatus;

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_errors_total: IntCounterVec,
    retries_total: IntCounterVec,
    admission_rejections_total: IntCounterVec,
    pool_connections: IntGaugeVec,
    tokens_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "gateway_http_requests_total",
                "Total HTTP requests processed by gateway"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "gateway_inflight_requests",
            "Current in-flight requests at gateway",
        )
        .expect("valid inflight_requests metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "gateway_backend_errors_total",
                "Total backend-related errors by stage"
            ),
            &["stage"],
        )
        .expect("valid backend_errors_total metric");

        let retries_total = IntCounterVec::new(
            opts!(
                "gateway_backend_retries_total",
                "Backend calls retried after a retryable failure"
            ),
            &["family"],
        )
        .expect("valid retries_total metric");

        let admission_rejections_total = IntCounterVec::new(
            opts!(
                "gateway_admission_rejections_total",
                "Requests rejected before reaching a backend"
            ),
            &["reason"],
        )
        .expect("valid admission_rejections_total metric");

        let pool_connections = IntGaugeVec::new(
            opts!(
                "gateway_pool_connections",
                "Backend connections owned by each pool"
            ),
            &["pool", "state"],
        )
        .expect("valid pool_connections metric");

        let tokens_total = IntCounterVec::new(
            opts!(
                "gateway_tokens_total",
                "Token accounting aggregated by type"
            ),
            &["kind"],
        )
        .expect("valid tokens_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(retries_total.clone()))
            .expect("register retries_total");
        registry
            .register(Box::new(admission_rejections_total.clone()))
            .expect("register admission_rejections_total");
        registry
            .register(Box::new(pool_connections.clone()))
            .expect("register pool_connections");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("register tokens_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_errors_total,
            retries_total,
            admission_rejections_total,
            pool_connections,
            tokens_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, stage: &str) {
        self.backend_errors_total.with_label_values(&[stage]).inc();
    }

    pub fn observe_retry(&self, family: &str) {
        self.retries_total.with_label_values(&[family]).inc();
    }

    pub fn observe_rejection(&self, reason: &str) {
        self.admission_rejections_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn observe_pools(&self, pools: &[PoolStatus]) {
        for pool in pools {
            self.pool_connections
                .with_label_values(&[&pool.name, "live"])
                .set(pool.live as i64);
            self.pool_connections
                .with_label_values(&[&pool.name, "idle"])
                .set(pool.idle as i64);
        }
    }

    pub fn observe_usage(&self, usage: &Usage) {
        self.tokens_total
            .with_label_values(&["prompt"])
            .inc_by(usage.prompt_tokens as u64);
        self.tokens_total
            .with_label_values(&["completion"])
            .inc_by(usage.completion_tokens as u64);
        self.tokens_total
            .with_label_values(&["total"])
            .inc_by(usage.total_tokens as u64);
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

/// Rolling request counters reported on the health endpoint. Minute counters reset every
/// 60 seconds and second counters every second.
#[derive(Debug, Default)]
pub struct RequestStats {
    total_minute: AtomicU64,
    total_second: AtomicU64,
    api_minute: AtomicU64,
    api_second: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RequestStatsSnapshot {
    pub rpm: u64,
    pub rps: u64,
    pub api_rpm: u64,
    pub api_rps: u64,
}

impl RequestStats {
    pub fn record(&self, api: bool) {
        self.total_minute.fetch_add(1, Ordering::Relaxed);
        self.total_second.fetch_add(1, Ordering::Relaxed);
        if api {
            self.api_minute.fetch_add(1, Ordering::Relaxed);
            self.api_second.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            rpm: self.total_minute.load(Ordering::Relaxed),
            rps: self.total_second.load(Ordering::Relaxed),
            api_rpm: self.api_minute.load(Ordering::Relaxed),
            api_rps: self.api_second.load(Ordering::Relaxed),
        }
    }

    pub fn reset_second(&self) {
        self.total_second.store(0, Ordering::Relaxed);
        self.api_second.store(0, Ordering::Relaxed);
    }

    pub fn reset_minute(&self) {
        self.total_minute.store(0, Ordering::Relaxed);
        self.api_minute.store(0, Ordering::Relaxed);
    }

    pub fn spawn_reset_ticks(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut second = tokio::time::interval(Duration::from_secs(1));
            let mut minute = tokio::time::interval(Duration::from_secs(60));
            second.tick().await;
            minute.tick().await;
            loop {
                tokio::select! {
                    _ = second.tick() => self.reset_second(),
                    _ = minute.tick() => self.reset_minute(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_metrics_include_retries_and_pools() {
        let metrics = AppMetrics::new();
        metrics.observe_retry("gpt");
        metrics.observe_pools(&[PoolStatus {
            name: "vertex".to_owned(),
            live: 4,
            idle: 2,
            min_size: 2,
            max_size: 8,
        }]);
        let rendered = metrics.render().expect("renders");
        assert!(rendered.contains("gateway_backend_retries_total{family=\"gpt\"} 1"));
        assert!(rendered.contains("gateway_pool_connections{pool=\"vertex\",state=\"live\"} 4"));
    }

    #[test]
    fn request_stats_reset_independently() {
        let stats = RequestStats::default();
        stats.record(true);
        stats.record(false);
        assert_eq!(
            stats.snapshot(),
            RequestStatsSnapshot {
                rpm: 2,
                rps: 2,
                api_rpm: 1,
                api_rps: 1
            }
        );
        stats.reset_second();
        let snapshot = stats.snapshot();
        assert_eq!((snapshot.rpm, snapshot.rps), (2, 0));
        stats.reset_minute();
        assert_eq!(stats.snapshot().api_rpm, 0);
    }
}
