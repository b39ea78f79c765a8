//! Prometheus metrics exposition for the agent
//!
//! Renders the session metrics recorded by `auth-session` plus the agent's
//! own request metrics:
//!
//! - `agent_requests_total` (counter): labels `route`, `status`
//! - `agent_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms up to the longest configurable remote timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Builder with histogram buckets for every duration metric, so they render
/// with `_bucket` lines instead of as summaries.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed agent request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("agent_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("agent_request_duration_seconds", "route" => route).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_metrics_render_as_histograms() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/deep-link", 200, 0.042);
        record_request("/deep-link", 400, 0.003);
        auth_session::metrics::record_operation("login", "success", 0.2);

        let output = handle.render();
        assert!(output.contains("agent_requests_total"));
        assert!(output.contains("route=\"/deep-link\""));
        assert!(output.contains("status=\"400\""));
        assert!(output.contains("agent_request_duration_seconds_bucket"));
        assert!(output.contains("auth_operation_duration_seconds_bucket"));
        assert!(output.contains("le=\"60\""));
    }
}
