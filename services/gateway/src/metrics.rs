//! Prometheus metrics exposition
//!
//! Gateway-level series recorded here:
//!
//! - `gateway_requests_total` (counter): labels `provider`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `provider`
//!
//! The engine crates record `dispatch_attempts_total`,
//! `credential_demotions_total` and `clearance_refresh_total` through the
//! same global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram boundaries for request latency, 50ms to 5 minutes. Media
/// generation routinely takes tens of seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one completed public request. `provider` is `"none"` when the
/// request never resolved to a provider.
pub fn record_request(provider: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "provider" => provider.to_string())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_request_does_not_panic_without_recorder() {
        record_request("grok", 200, 0.05);
    }

    /// Isolated recorder/handle pair; only one global recorder can exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("grok", 200, 12.5);
        record_request("gemini", 503, 0.2);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("provider=\"grok\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"300\""), "5 minute bucket must exist");
    }

    #[test]
    fn engine_counters_render_through_same_recorder() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::counter!(
            "dispatch_attempts_total",
            "provider" => "grok",
            "outcome" => "rate_limited"
        )
        .increment(1);

        let output = handle.render();
        assert!(output.contains("dispatch_attempts_total"));
        assert!(output.contains("outcome=\"rate_limited\""));
    }
}
