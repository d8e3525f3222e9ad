use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::{
    metrics::{DURATION_BUCKETS, PORTICO_REQUEST_DURATION_SECONDS, describe_metrics, record_request},
    ports::metrics_sink::{MetricsSink, RequestMetrics},
};

/// Metrics sink owning a private Prometheus recorder.
///
/// The recorder is never installed globally, so several pipelines (or tests)
/// in one process keep separate registries.
pub struct PrometheusMetricsSink {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusMetricsSink {
    pub fn new() -> Result<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(PORTICO_REQUEST_DURATION_SECONDS.to_string()),
                DURATION_BUCKETS,
            )
            .wrap_err("Failed to configure request duration buckets")?
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, describe_metrics);

        Ok(Self { recorder, handle })
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn record(&self, metrics: &RequestMetrics) {
        metrics::with_local_recorder(&self.recorder, || record_request(metrics));
    }
}
