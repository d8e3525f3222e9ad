use crate::{core::trace::TraceRecord, ports::trace_sink::TraceSink};

/// Writes finished trace records to the log under the `portico::trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn push(&self, record: TraceRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => tracing::debug!(
                target: "portico::trace",
                trace_id = %record.id,
                success = record.success,
                cost_seconds = record.cost_seconds,
                record = %json,
                "trace finished"
            ),
            Err(e) => tracing::warn!(
                target: "portico::trace",
                trace_id = %record.id,
                "Failed to serialize trace record: {}",
                e
            ),
        }
    }
}
