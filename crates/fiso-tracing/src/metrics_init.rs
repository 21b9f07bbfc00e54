use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusHandle;

/// Installs the process-global Prometheus metrics recorder. The returned
/// handle renders the current registry as Prometheus exposition text; the
/// caller exposes that under a `/metrics` route on the server pool.
///
/// Counters/histograms the pipeline emits through this recorder:
/// `fiso_events_processed_total{flow,outcome}`, `fiso_retries_total{flow}`,
/// `fiso_dlq_sends_total{flow}`, `fiso_sink_latency_seconds{flow}`.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")
}
