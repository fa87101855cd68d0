//! Prometheus export for the counters recorded across the service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;
    let _ = METRICS_HANDLE.set(handle);

    describe();
    Ok(())
}

fn describe() {
    metrics::describe_counter!(
        "wopi_operations_total",
        "WOPI operations by operation and outcome"
    );
    metrics::describe_counter!("wopi_bytes_total", "File bytes served (out) and stored (in)");
    metrics::describe_counter!("wopi_tokens_issued_total", "Access tokens issued by permission");
    metrics::describe_histogram!(
        "wopi_operation_duration_seconds",
        metrics::Unit::Seconds,
        "WOPI operation latency"
    );
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
