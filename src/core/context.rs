//! Per-request state shared by the pipeline stages and the application handlers.
//!
//! A [`RequestContext`] is owned by exactly one in-flight request. Handlers
//! report their outcome only by mutating it: setting a payload, aborting with a
//! [`ClassifiedError`], overriding the metrics alias or recording non-fatal
//! errors. Instances are recycled through [`ContextPool`](super::pool::ContextPool),
//! so [`RequestContext::reset`] must clear every field.
use axum::extract::Query;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, header, request::Parts};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::core::{error::ClassifiedError, trace::TraceRecord};

/// Authenticated caller. Zero values mean anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: i64,
    pub user_name: String,
}

#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    matched_path: Option<String>,
    params: Vec<(String, String)>,
    raw_body: Bytes,

    identity: Option<Identity>,
    payload: Option<serde_json::Value>,
    abort_error: Option<ClassifiedError>,
    errors: Vec<eyre::Report>,
    alias: Option<String>,

    trace_enabled: bool,
    trace_id: Option<String>,
    trace: Option<TraceRecord>,

    response_headers: HeaderMap,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            headers: HeaderMap::new(),
            matched_path: None,
            params: Vec::new(),
            raw_body: Bytes::new(),
            identity: None,
            payload: None,
            abort_error: None,
            errors: Vec::new(),
            alias: None,
            trace_enabled: false,
            trace_id: None,
            trace: None,
            response_headers: HeaderMap::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl RequestContext {
    /// Load the request view. Called once, right after acquisition.
    pub(crate) fn prepare(
        &mut self,
        parts: Parts,
        raw_body: Bytes,
        matched_path: Option<String>,
        params: Vec<(String, String)>,
    ) {
        self.method = parts.method;
        self.uri = parts.uri;
        self.headers = parts.headers;
        self.matched_path = matched_path;
        self.params = params;
        self.raw_body = raw_body;
    }

    /// Clear every field so the instance can serve an unrelated request.
    ///
    /// Collections are cleared in place to keep their allocations.
    pub(crate) fn reset(&mut self) {
        self.method = Method::GET;
        self.uri = Uri::default();
        self.headers.clear();
        self.matched_path = None;
        self.params.clear();
        self.raw_body = Bytes::new();
        self.identity = None;
        self.payload = None;
        self.abort_error = None;
        self.errors.clear();
        self.alias = None;
        self.trace_enabled = false;
        self.trace_id = None;
        self.trace = None;
        self.response_headers.clear();
        self.cancel = CancellationToken::new();
    }

    /// True when no request-specific state is present.
    pub(crate) fn is_clean(&self) -> bool {
        self.headers.is_empty()
            && self.matched_path.is_none()
            && self.params.is_empty()
            && self.raw_body.is_empty()
            && self.identity.is_none()
            && self.payload.is_none()
            && self.abort_error.is_none()
            && self.errors.is_empty()
            && self.alias.is_none()
            && !self.trace_enabled
            && self.trace_id.is_none()
            && self.trace.is_none()
            && self.response_headers.is_empty()
            && !self.cancel.is_cancelled()
    }

    // --- request view ---

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Form-decoded path and query, as used for metrics grouping and traces.
    ///
    /// `+` reads as a space and `%XX` escapes are decoded; a result that is not
    /// valid UTF-8 falls back to the raw text.
    pub fn decoded_uri(&self) -> String {
        let raw = self
            .uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str());
        let spaced = raw.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| raw.to_string())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as text. Non-UTF-8 values are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> &str {
        self.header(header::HOST.as_str())
            .or_else(|| self.uri.host())
            .unwrap_or_default()
    }

    /// Route pattern the engine matched, e.g. `/users/{id}`.
    pub fn matched_path(&self) -> Option<&str> {
        self.matched_path.as_deref()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Request body snapshot captured at entry.
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Deserialize the JSON body. Failures map to a 400 param-bind error.
    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, ClassifiedError> {
        serde_json::from_slice(&self.raw_body)
            .map_err(|e| ClassifiedError::param_bind_error().with_cause(e))
    }

    /// Deserialize the query string. Failures map to a 400 param-bind error.
    pub fn bind_query<T: DeserializeOwned>(&self) -> Result<T, ClassifiedError> {
        Query::<T>::try_from_uri(&self.uri)
            .map(|Query(value)| value)
            .map_err(|e| ClassifiedError::param_bind_error().with_cause(eyre::eyre!("{e}")))
    }

    /// Fires when the request completes or the client goes away.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // --- identity ---

    pub fn identity(&self) -> Identity {
        self.identity.clone().unwrap_or_default()
    }

    pub fn user_id(&self) -> i64 {
        self.identity.as_ref().map_or(0, |id| id.user_id)
    }

    pub fn user_name(&self) -> &str {
        self.identity
            .as_ref()
            .map_or("", |id| id.user_name.as_str())
    }

    /// Set the caller identity. Only the first call per request has an effect.
    pub(crate) fn set_identity(&mut self, identity: Identity) -> bool {
        if self.identity.is_some() {
            tracing::warn!(
                path = %self.uri.path(),
                "Identity already set for this request, ignoring"
            );
            return false;
        }
        self.identity = Some(identity);
        true
    }

    // --- outcome ---

    /// Set the success body. A value that cannot be serialized aborts the
    /// request with a server error instead.
    pub fn set_payload<T: Serialize + ?Sized>(&mut self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.payload = Some(value),
            Err(e) => self.abort(ClassifiedError::server_error().with_cause(e)),
        }
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    /// Stop processing and answer with `err`. The first abort wins.
    pub fn abort(&mut self, err: ClassifiedError) {
        if self.abort_error.is_none() {
            self.abort_error = Some(err);
        } else {
            self.errors.push(eyre::eyre!("{err}"));
        }
    }

    /// Replace any abort set by handlers. Used for recovered panics, which take
    /// precedence over every other outcome.
    pub(crate) fn force_abort(&mut self, err: ClassifiedError) {
        if let Some(previous) = self.abort_error.replace(err) {
            self.errors.push(eyre::eyre!("{previous}"));
        }
    }

    pub fn abort_error(&self) -> Option<&ClassifiedError> {
        self.abort_error.as_ref()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_error.is_some()
    }

    /// Record a non-fatal error. It is only reported in the digest log line.
    pub fn push_error<E: Into<eyre::Report>>(&mut self, err: E) {
        self.errors.push(err.into());
    }

    pub fn errors(&self) -> &[eyre::Report] {
        &self.errors
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Override the URI reported to metrics. Blank values are ignored.
    pub fn set_alias(&mut self, alias: &str) {
        let alias = alias.trim();
        if !alias.is_empty() {
            self.alias = Some(alias.to_string());
        }
    }

    /// Add a header to the response.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    // --- tracing ---

    /// Turn tracing on with the given id. The first id set is kept.
    pub(crate) fn enable_trace(&mut self, id: String) {
        self.trace_enabled = true;
        if self.trace_id.is_none() {
            self.trace_id = Some(id);
        }
    }

    /// Turn tracing off for the rest of this request.
    pub fn disable_trace(&mut self) {
        self.trace_enabled = false;
        self.trace = None;
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Correlation id, present only while tracing is enabled.
    pub fn trace_id(&self) -> Option<&str> {
        if self.trace_enabled {
            self.trace_id.as_deref()
        } else {
            None
        }
    }

    /// The trace record, created on first access.
    pub fn trace_mut(&mut self) -> Option<&mut TraceRecord> {
        if !self.trace_enabled {
            return None;
        }
        let id = self.trace_id.clone()?;
        Some(self.trace.get_or_insert_with(|| TraceRecord::new(id)))
    }

    pub fn trace(&self) -> Option<&TraceRecord> {
        self.trace.as_ref()
    }

    /// Append a debug entry to the trace (no-op when tracing is off).
    pub fn trace_debug(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if let Some(trace) = self.trace_mut() {
            trace.append_debug(key, value);
        }
    }
}
