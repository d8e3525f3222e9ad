//! Metric families recorded for every request leaving the pipeline.
//!
//! Functions here only emit through the `metrics` macros; the recorder they
//! land in is chosen by the caller (see
//! [`PrometheusMetricsSink`](crate::adapters::PrometheusMetricsSink), which
//! scopes them to its own recorder).
//!
//! Provided metrics:
//! * `portico_requests_total` (counter; method, uri, status, business_code, success)
//! * `portico_request_duration_seconds` (histogram; method, uri)
use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};

use crate::ports::metrics_sink::RequestMetrics;

pub const PORTICO_REQUESTS_TOTAL: &str = "portico_requests_total";
pub const PORTICO_REQUEST_DURATION_SECONDS: &str = "portico_request_duration_seconds";

/// Histogram buckets for request latency, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Register descriptions with the current recorder.
pub fn describe_metrics() {
    describe_counter!(
        PORTICO_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests that completed the pipeline."
    );
    describe_histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent by a request inside the pipeline."
    );
}

/// Count one finished request.
pub fn increment_request_total(metrics: &RequestMetrics) {
    counter!(
        PORTICO_REQUESTS_TOTAL,
        "method" => metrics.method.clone(),
        "uri" => metrics.uri.clone(),
        "status" => metrics.http_status.to_string(),
        "business_code" => metrics.business_code.to_string(),
        "success" => metrics.success.to_string()
    )
    .increment(1);
}

/// Record the duration of one finished request.
pub fn record_request_duration(metrics: &RequestMetrics) {
    histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        "method" => metrics.method.clone(),
        "uri" => metrics.uri.clone()
    )
    .record(metrics.cost_seconds);
}

pub fn record_request(metrics: &RequestMetrics) {
    increment_request_total(metrics);
    record_request_duration(metrics);
}
