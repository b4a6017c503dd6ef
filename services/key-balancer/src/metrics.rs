//! Prometheus metrics exposition
//!
//! - `balancer_requests_total` (counter): labels `status`, `method`
//! - `balancer_request_duration_seconds` (histogram): label `status`
//! - `balancer_keys_active` / `balancer_keys_disabled` (gauges)
//! - `balancer_key_disabled_total` and `balancer_keys_reactivated_total` are
//!   recorded by the dispatcher and the reactivation scheduler

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use key_pool::PoolSummary;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("balancer_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The duration metric gets explicit buckets so it renders as a histogram
/// with `_bucket` lines rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("balancer_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("balancer_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Publish pool health gauges.
pub fn set_key_gauges(summary: &PoolSummary) {
    metrics::gauge!("balancer_keys_active").set(summary.active as f64);
    metrics::gauge!("balancer_keys_disabled").set(summary.disabled as f64);
}

/// Counters surfaced on `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being proxied; reported when the drain times out.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
