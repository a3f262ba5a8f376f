//! Prometheus metrics recording and endpoint.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

pub fn set_active_connections(count: usize) {
    metrics::gauge!("event_channels_active").set(count as f64);
}

/// Record a run by how its events were delivered ("direct" or "channel").
pub fn record_run(mode: &'static str) {
    metrics::counter!("agent_runs_total", "mode" => mode).increment(1);
}

pub fn record_queued(count: usize) {
    metrics::counter!("events_queued_total").increment(count as u64);
}

pub fn record_eviction(reason: &'static str) {
    metrics::counter!("evictions_total", "reason" => reason).increment(1);
}
