//! Correlation ids and per-request trace records.
//!
//! [`TraceCorrelator::begin`] decides whether a request is traced and fixes its
//! id; [`TraceCorrelator::finish`] fills in the request and response halves of
//! the [`TraceRecord`] once the response is known and hands it to the sink.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use http::{HeaderMap, StatusCode};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{core::context::RequestContext, ports::trace_sink::TraceSink};

/// Header carrying the correlation id in both directions.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Paths that are never traced. Matched exactly against the request path.
pub static TRACE_EXEMPT_PATHS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "/metrics",
        "/debug/pprof/",
        "/debug/pprof/cmdline",
        "/debug/pprof/profile",
        "/debug/pprof/symbol",
        "/debug/pprof/trace",
        "/debug/pprof/allocs",
        "/debug/pprof/block",
        "/debug/pprof/goroutine",
        "/debug/pprof/heap",
        "/debug/pprof/mutex",
        "/debug/pprof/threadcreate",
        "/favicon.ico",
        "/system/health",
    ]
    .into_iter()
    .collect()
});

pub fn is_trace_exempt(path: &str) -> bool {
    TRACE_EXEMPT_PATHS.contains(path)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceRequest {
    pub ttl: String,
    pub method: String,
    pub decoded_url: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceResponse {
    pub header: BTreeMap<String, Vec<String>>,
    pub http_status: u16,
    pub http_status_text: String,
    pub business_code: i32,
    pub business_message: String,
    pub body: Option<serde_json::Value>,
    pub cost_seconds: f64,
}

/// Free-form debug entry appended by handlers.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDebug {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceRecord {
    pub id: String,
    pub request: Option<TraceRequest>,
    pub response: Option<TraceResponse>,
    pub debugs: Vec<TraceDebug>,
    pub success: bool,
    pub cost_seconds: f64,
}

impl TraceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn append_debug(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.debugs.push(TraceDebug {
            key: key.into(),
            value,
        });
    }
}

/// Final response state handed to [`TraceCorrelator::finish`].
#[derive(Debug, Clone)]
pub struct ResponseSummary<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub business_code: i32,
    pub business_message: &'a str,
    pub body: Option<serde_json::Value>,
    pub success: bool,
    pub cost_seconds: f64,
}

pub fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

pub struct TraceCorrelator {
    sink: Option<Arc<dyn TraceSink>>,
}

impl TraceCorrelator {
    pub fn new(sink: Option<Arc<dyn TraceSink>>) -> Self {
        Self { sink }
    }

    /// Fix the correlation id for this request, or disable tracing for exempt paths.
    pub fn begin(&self, ctx: &mut RequestContext) {
        if is_trace_exempt(ctx.path()) {
            ctx.disable_trace();
            return;
        }

        let incoming = ctx
            .header(TRACE_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let id = incoming.unwrap_or_else(generate_trace_id);
        ctx.enable_trace(id);
    }

    /// Complete the trace record and push it to the sink.
    ///
    /// Returns the finished record (for the digest log line), or `None` when
    /// tracing was disabled for this request.
    pub fn finish(
        &self,
        ctx: &mut RequestContext,
        summary: &ResponseSummary<'_>,
    ) -> Option<TraceRecord> {
        let request = TraceRequest {
            ttl: "un-limit".to_string(),
            method: ctx.method().to_string(),
            decoded_url: ctx.decoded_uri(),
            header: header_map_to_btree(ctx.headers()),
            body: String::from_utf8_lossy(ctx.raw_body()).into_owned(),
        };

        let record = ctx.trace_mut()?;
        record.request = Some(request);
        record.response = Some(TraceResponse {
            header: header_map_to_btree(summary.headers),
            http_status: summary.status.as_u16(),
            http_status_text: summary
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            business_code: summary.business_code,
            business_message: summary.business_message.to_string(),
            body: summary.body.clone(),
            cost_seconds: summary.cost_seconds,
        });
        record.success = summary.success;
        record.cost_seconds = summary.cost_seconds;

        let finished = record.clone();
        if let Some(sink) = &self.sink {
            sink.push(finished.clone());
        }
        Some(finished)
    }
}

/// New opaque correlation id.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
