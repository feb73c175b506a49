use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Usage of the Piazza RPC endpoints over the life of a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Replies that asked us to slow down, by message or HTTP 429.
    pub rate_limited_requests: u64,
    /// Requests that never got an HTTP status back.
    pub transport_failures: u64,
    pub total_response_time: Duration,
    pub last_request_at: Option<SystemTime>,
    pub by_status: BTreeMap<u16, u64>,
    pub by_method: BTreeMap<String, MethodMetrics>,
}

impl ApiMetrics {
    pub fn average_response_time(&self) -> Duration {
        average(self.total_response_time, self.total_requests)
    }

    /// Share of requests that were throttled, in `[0, 1]`.
    pub fn throttle_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.rate_limited_requests as f64 / self.total_requests as f64
        }
    }
}

/// Counters for one RPC method (`content.get`, `network.get_my_feed`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub calls: u64,
    pub failures: u64,
    pub throttled: u64,
    pub total_time: Duration,
    pub slowest: Duration,
}

impl MethodMetrics {
    fn record(&mut self, request: &RequestMetrics) {
        self.calls += 1;
        self.total_time += request.response_time;
        self.slowest = self.slowest.max(request.response_time);
        if !request.success {
            self.failures += 1;
        }
        if request.rate_limited {
            self.throttled += 1;
        }
    }

    pub fn average_response_time(&self) -> Duration {
        average(self.total_time, self.calls)
    }
}

/// Outcome of a single RPC call.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub method: String,
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub success: bool,
    pub rate_limited: bool,
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

/// Shared, lock-protected [`ApiMetrics`].
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<ApiMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_request(&self, request: RequestMetrics) {
        let mut metrics = self.metrics.write().await;

        metrics.total_requests += 1;
        metrics.total_response_time += request.response_time;
        metrics.last_request_at = Some(SystemTime::now());

        if request.success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        if request.rate_limited {
            metrics.rate_limited_requests += 1;
        }
        match request.status_code {
            Some(code) => *metrics.by_status.entry(code).or_default() += 1,
            None => metrics.transport_failures += 1,
        }

        metrics
            .by_method
            .entry(request.method.clone())
            .or_default()
            .record(&request);
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn get_method_metrics(&self, method: &str) -> Option<MethodMetrics> {
        self.metrics.read().await.by_method.get(method).cloned()
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.write().await = ApiMetrics::default();
    }
}
