//! A thin `metrics` facade: install a process-wide Prometheus recorder so
//! the `metrics::counter!`/`metrics::gauge!` call sites already scattered
//! through `ps-store` (push/pull counters, shard-transfer gauges) land
//! somewhere a scrape can see. Mirrors the teacher workspace's
//! `CompositeMetricsRecorder` at a much smaller scale: one recorder, no
//! fan-out, installed once at process startup.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use ps_errors::{PsError, PsResult};

/// Install the global Prometheus recorder and return a handle whose
/// `render()` produces the exposition-format text body for a metrics
/// endpoint. Calling this more than once per process panics in the
/// underlying `metrics` facade, so a binary entry point should call it
/// exactly once before constructing any node.
pub fn install_metrics_recorder() -> PsResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PsError::internal(format!("failed to install metrics recorder: {e}")))
}
