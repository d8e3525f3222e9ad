/// One finished request, as reported to the metrics collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetrics {
    pub method: String,
    /// Alias when the handler set one, otherwise the decoded request URI
    pub uri: String,
    /// `http_status == 200` and the request was not aborted
    pub success: bool,
    pub http_status: u16,
    /// Zero when no business error was returned
    pub business_code: i32,
    pub cost_seconds: f64,
    /// Empty when tracing was disabled for the request
    pub trace_id: String,
}

/// MetricsSink defines the port for recording per-request metrics
///
/// Called exactly once per request, after the response has been assembled.
/// Implementations must not block.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, metrics: &RequestMetrics);
}
