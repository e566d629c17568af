//! Client-side metrics
//!
//! Emitted through the `metrics` facade; with no recorder installed every
//! call is a no-op. Embedders that install a Prometheus recorder should use
//! [`REQUEST_DURATION_BUCKETS`] for the duration histogram.
//!
//! - `client_requests_total` (counter): label `outcome`
//! - `client_request_duration_seconds` (histogram): label `outcome`
//! - `client_retries_total` (counter): label `reason`
//! - `client_token_refresh_total` (counter): labels `trigger`, `result`

/// Histogram buckets for `client_request_duration_seconds`, 5ms to 60s.
pub const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Record a finished logical request. `outcome` is `ok` or an error kind name.
pub fn record_request(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("client_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("client_request_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

/// Record one transient resend.
pub fn record_retry(reason: &'static str) {
    metrics::counter!("client_retries_total", "reason" => reason).increment(1);
}

/// Record one refresh exchange.
pub fn record_refresh(trigger: &'static str, result: &'static str) {
    metrics::counter!("client_token_refresh_total", "trigger" => trigger, "result" => result)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "client_request_duration_seconds".to_string(),
                ),
                REQUEST_DURATION_BUCKETS,
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("ok", 0.05);
        record_retry("rate_limited");
        record_refresh("proactive", "success");
    }

    #[test]
    fn record_request_writes_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("ok", 0.042);
        record_request("RATE_LIMITED", 1.5);

        let output = handle.render();
        assert!(output.contains("client_requests_total"));
        assert!(output.contains("outcome=\"ok\""));
        assert!(output.contains("outcome=\"RATE_LIMITED\""));
        assert!(
            output.contains("client_request_duration_seconds_bucket"),
            "duration must render as a histogram"
        );
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn retry_and_refresh_counters_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_retry("server_error");
        record_retry("network");
        record_refresh("reactive-401", "failure");

        let output = handle.render();
        assert!(output.contains("client_retries_total"));
        assert!(output.contains("reason=\"server_error\""));
        assert!(output.contains("reason=\"network\""));
        assert!(output.contains("client_token_refresh_total"));
        assert!(output.contains("trigger=\"reactive-401\""));
        assert!(output.contains("result=\"failure\""));
    }
}
