use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Error type for panic notification delivery
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NotifyError {
    /// The notification could not be delivered
    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    /// The receiving endpoint rejected the notification
    #[error("Notification rejected with status {status}")]
    Rejected { status: u16 },
}

/// Everything known about a recovered panic, sent to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PanicReport {
    pub method: String,
    pub host: String,
    pub uri: String,
    pub trace_id: String,
    pub message: String,
    pub stack: String,
    pub timestamp: String,
}

/// PanicNotifier defines the port for alerting on recovered panics
///
/// Delivery is best effort: the pipeline logs a returned error and carries on.
#[async_trait]
pub trait PanicNotifier: Send + Sync + 'static {
    async fn notify(&self, report: &PanicReport) -> Result<(), NotifyError>;
}
