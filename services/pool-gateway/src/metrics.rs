//! Prometheus metrics exposition
//!
//! Gateway-level series, alongside the pool's own counters:
//!
//! - `gateway_queries_total` (counter): labels `status`, `mode`
//! - `gateway_query_duration_seconds` (histogram): label `status`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Upstream answers range from sub-second auto queries to multi-minute
/// deep-research runs.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_query_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one finished `/query` call.
pub fn record_query(status: &str, mode: &str, duration_secs: f64) {
    metrics::counter!(
        "gateway_queries_total",
        "status" => status.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_query_duration_seconds", "status" => status.to_string())
        .record(duration_secs);
}
