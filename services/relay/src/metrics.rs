//! Prometheus metrics exposition
//!
//! The dispatcher and rotator crates emit through the `metrics` facade; this
//! module installs the recorder that renders them at `/metrics`, and records
//! the relay's own fetch counter:
//!
//! - `relay_fetch_attempts_total` (counter): label `outcome`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries for `dispatcher_job_duration_seconds`: a fetch may sit
/// behind a rate-limit wait of a couple of minutes plus retries.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("dispatcher_job_duration_seconds".to_string()),
            JOB_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `dispatcher_job_duration_seconds` gets explicit buckets so it renders as a
/// Prometheus histogram rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one upstream fetch attempt.
///
/// `outcome` is `success` or a failure class label.
pub fn record_fetch(outcome: &str) {
    metrics::counter!("relay_fetch_attempts_total", "outcome" => outcome.to_string())
        .increment(1);
}
