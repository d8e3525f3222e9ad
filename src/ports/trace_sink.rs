use crate::core::trace::TraceRecord;

/// TraceSink defines the port receiving finished trace records
pub trait TraceSink: Send + Sync + 'static {
    /// Accept one finished record. Must not block the request path.
    fn push(&self, record: TraceRecord);
}
