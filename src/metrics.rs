//! Prometheus metrics

use crate::transport::TransportKind;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record an upstream instance coming up for an endpoint
pub fn record_instance_created(endpoint: &str, namespace_id: &str) {
    metrics::counter!("gateway_upstream_instances_created_total",
        "endpoint" => endpoint.to_string(),
        "namespace" => namespace_id.to_string()
    )
    .increment(1);
}

/// Record a failed upstream creation
pub fn record_instance_creation_failure(endpoint: &str) {
    metrics::counter!("gateway_upstream_creation_failures_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record an upstream teardown (attempted, successful or not)
pub fn record_instance_torn_down(endpoint: &str) {
    metrics::counter!("gateway_upstream_instances_torn_down_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

pub fn record_session_begun(endpoint: &str, kind: TransportKind) {
    metrics::counter!("gateway_sessions_begun_total",
        "endpoint" => endpoint.to_string(),
        "transport" => kind.to_string()
    )
    .increment(1);
}

pub fn record_session_ended(endpoint: &str) {
    metrics::counter!("gateway_sessions_ended_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a rejected credential; `reason` is `required`, `invalid` or `validator_error`
pub fn record_auth_failure(endpoint: &str, reason: &'static str) {
    metrics::counter!("gateway_auth_failures_total",
        "endpoint" => endpoint.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Update active session gauge
pub fn update_active_sessions(count: usize) {
    metrics::gauge!("gateway_active_sessions").set(count as f64);
}
