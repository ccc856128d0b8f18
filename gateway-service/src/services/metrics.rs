//! Metrics collection and Prometheus export.
//!
//! The recorder is installed once from `main`. Without it every `metrics!`
//! call is a no-op, which is what tests rely on.

use crate::models::TokenUsage;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Must run before any metric is recorded.
pub fn init_metrics() -> Result<(), String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| "metrics recorder already initialized".to_string())
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// One finished upstream call. `outcome` is `success` or an error class.
pub fn record_upstream_call(model: &str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "gateway_upstream_requests_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("gateway_upstream_latency_seconds", "model" => model.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_tokens(model: &str, usage: &TokenUsage) {
    counter!("gateway_tokens_total", "model" => model.to_string(), "type" => "prompt")
        .increment(usage.prompt_tokens as u64);
    counter!("gateway_tokens_total", "model" => model.to_string(), "type" => "completion")
        .increment(usage.completion_tokens as u64);
}

pub fn record_candidate(outcome: &'static str) {
    counter!("gateway_ensemble_candidates_total", "outcome" => outcome).increment(1);
}

pub fn record_router_fallback(reason: &'static str) {
    counter!("gateway_router_fallbacks_total", "reason" => reason).increment(1);
}

pub fn record_room_event_dropped() {
    counter!("gateway_room_events_dropped_total").increment(1);
}
