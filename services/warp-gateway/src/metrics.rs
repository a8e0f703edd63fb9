//! Prometheus metrics exposition
//!
//! Counters:
//! - `gateway_requests_total` (labels `format`, `status`)
//! - `gateway_upstream_errors_total` (label `kind`)
//! - `gateway_account_failovers_total`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering.
///
/// The handle's `render()` produces the text exposition format served on
/// `GET /metrics`.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed client request.
pub fn record_request(format: &'static str, status: u16) {
    metrics::counter!(
        "gateway_requests_total",
        "format" => format,
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record an upstream fault by classification.
pub fn record_upstream_error(kind: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "kind" => kind).increment(1);
}

/// Record a retry onto another account.
pub fn record_failover() {
    metrics::counter!("gateway_account_failovers_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("openai", 200);
        record_upstream_error("rate_limited");
        record_failover();
    }

    /// Isolated recorder: only one global recorder may exist per process,
    /// so tests use a local one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn counters_render_with_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("openai", 200);
        record_request("anthropic", 503);
        record_upstream_error("blocked");
        record_failover();

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("format=\"openai\""));
        assert!(output.contains("status=\"503\""));
        assert!(output.contains("kind=\"blocked\""));
        assert!(output.contains("gateway_account_failovers_total"));
    }
}
