//! Lifecycle metrics
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line. The
//! binary installs a Prometheus exporter when built with the `prometheus`
//! feature; otherwise every call is a no-op.
//!
//! # Metrics
//!
//! - `scopekeeper_sessions_created_total`: Counter of created sessions
//! - `scopekeeper_sessions_ended_total`: Counter of ended sessions by reason
//! - `scopekeeper_sessions_active`: Gauge of sessions held by the registry
//! - `scopekeeper_cleanup_failures_total`: Counter of failed end hooks
//! - `scopekeeper_fanout_items_total`: Counter of fan-out items by outcome
//! - `scopekeeper_sweep_duration_seconds`: Histogram of sweep tick duration

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::time::Duration;

/// Initializes the Prometheus exporter
///
/// Only has an effect when compiled with the `prometheus` feature. The
/// exporter listens on its default address, `0.0.0.0:9000`.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}

pub(crate) fn session_created() {
    increment_counter!("scopekeeper_sessions_created_total");
    increment_gauge!("scopekeeper_sessions_active", 1.0);
}

pub(crate) fn session_ended(reason: &'static str) {
    increment_counter!("scopekeeper_sessions_ended_total", "reason" => reason);
    decrement_gauge!("scopekeeper_sessions_active", 1.0);
}

pub(crate) fn cleanup_failed() {
    increment_counter!("scopekeeper_cleanup_failures_total");
}

pub(crate) fn fanout_item(outcome: &'static str) {
    increment_counter!("scopekeeper_fanout_items_total", "outcome" => outcome);
}

pub(crate) fn sweep_finished(elapsed: Duration) {
    histogram!("scopekeeper_sweep_duration_seconds", elapsed.as_secs_f64());
}
