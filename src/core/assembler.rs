//! Final stage of the pipeline: turns the context state into the wire response.
//!
//! Terminal states, highest precedence first:
//! 1. [`Outcome::Panic`]: a recovered fault, answered as a 500 server error.
//! 2. [`Outcome::NotFound`]: the engine matched no route (or no method); no body.
//! 3. [`Outcome::BusinessAbort`]: a handler (or the rate limiter) aborted; the
//!    error's status with a `{code, message}` body. Wins over a payload.
//! 4. [`Outcome::Success`]: 200 with the payload as JSON, or an empty body.
//!
//! Afterwards metrics are recorded once, the trace is finished and one digest
//! log line is emitted.
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    response::{IntoResponse, Response},
};
use http::{HeaderName, HeaderValue, StatusCode};
use tokio::time::Instant;

use crate::{
    config::models::PipelineConfig,
    core::{
        context::RequestContext,
        error::{ClassifiedError, RequestFault},
        trace::{ResponseSummary, TRACE_HEADER, TraceCorrelator},
    },
    ports::metrics_sink::{MetricsSink, RequestMetrics},
};

/// How the engine resolved the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    Matched,
    NotFound,
    MethodNotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    BusinessAbort,
    NotFound,
    Panic,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::BusinessAbort => "business_abort",
            Outcome::NotFound => "not_found",
            Outcome::Panic => "panic",
        }
    }
}

/// Verbosity of the per-request digest line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestMode {
    Disabled,
    Simple,
    Structured,
}

impl DigestMode {
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.disable_structured_logger {
            DigestMode::Disabled
        } else if config.use_simple_log_line {
            DigestMode::Simple
        } else {
            DigestMode::Structured
        }
    }
}

/// What the assembler decided, for span bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Assembled {
    pub outcome: Outcome,
    pub status: StatusCode,
    pub cost_seconds: f64,
}

pub struct ResponseAssembler {
    metrics: Option<Arc<dyn MetricsSink>>,
    tracer: TraceCorrelator,
    digest: DigestMode,
}

impl ResponseAssembler {
    pub fn new(
        metrics: Option<Arc<dyn MetricsSink>>,
        tracer: TraceCorrelator,
        digest: DigestMode,
    ) -> Self {
        Self {
            metrics,
            tracer,
            digest,
        }
    }

    pub fn tracer(&self) -> &TraceCorrelator {
        &self.tracer
    }

    fn classify(ctx: &RequestContext, route: RouteMatch, fault: Option<&RequestFault>) -> Outcome {
        if fault.is_some() {
            Outcome::Panic
        } else if route != RouteMatch::Matched {
            Outcome::NotFound
        } else if ctx.is_aborted() {
            Outcome::BusinessAbort
        } else {
            Outcome::Success
        }
    }

    pub fn assemble(
        &self,
        ctx: &mut RequestContext,
        route: RouteMatch,
        fault: Option<&RequestFault>,
        started: Instant,
    ) -> (Response, Assembled) {
        let outcome = Self::classify(ctx, route, fault);

        let (status, body, business_code, business_message) = match outcome {
            Outcome::Panic | Outcome::BusinessAbort => {
                let err = match (ctx.abort_error(), fault) {
                    (_, Some(fault)) => fault.classify(),
                    (Some(err), None) => err.clone(),
                    (None, None) => ClassifiedError::server_error(),
                };
                let body = serde_json::to_value(err.to_failure()).ok();
                (
                    err.http_status(),
                    body,
                    err.business_code(),
                    err.business_message().to_string(),
                )
            }
            Outcome::NotFound => {
                let status = match route {
                    RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
                    _ => StatusCode::NOT_FOUND,
                };
                (status, None, 0, String::new())
            }
            Outcome::Success => (StatusCode::OK, ctx.payload().cloned(), 0, String::new()),
        };

        let mut response = match &body {
            Some(value) => Json(value).into_response(),
            None => Response::new(Body::empty()),
        };
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in ctx.response_headers() {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(id) = ctx.trace_id() {
            match HeaderValue::from_str(id) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(TRACE_HEADER), value);
                }
                Err(e) => tracing::warn!("Trace id is not a valid header value: {}", e),
            }
        }

        let aborted = matches!(outcome, Outcome::Panic | Outcome::BusinessAbort);
        let success = status == StatusCode::OK && !aborted;
        let cost_seconds = started.elapsed().as_secs_f64();
        let trace_id = ctx.trace_id().unwrap_or_default().to_string();
        let uri = ctx
            .alias()
            .map_or_else(|| ctx.decoded_uri(), str::to_string);

        if let Some(metrics) = &self.metrics {
            metrics.record(&RequestMetrics {
                method: ctx.method().to_string(),
                uri: uri.clone(),
                success,
                http_status: status.as_u16(),
                business_code,
                cost_seconds,
                trace_id: trace_id.clone(),
            });
        }

        let summary = ResponseSummary {
            status,
            headers: response.headers(),
            business_code,
            business_message: &business_message,
            body,
            success,
            cost_seconds,
        };
        let trace = self.tracer.finish(ctx, &summary);

        match self.digest {
            DigestMode::Disabled => {}
            DigestMode::Simple => {
                tracing::info!(
                    target: "portico::access",
                    "interceptor | method: {} | path: {} | http_code: {}",
                    ctx.method(),
                    ctx.decoded_uri(),
                    status.as_u16()
                );
            }
            DigestMode::Structured => {
                let errors = aggregate_errors(ctx);
                let trace_info = trace
                    .as_ref()
                    .and_then(|record| serde_json::to_string(record).ok());
                tracing::info!(
                    target: "portico::access",
                    method = %ctx.method(),
                    path = %ctx.decoded_uri(),
                    metrics_uri = %uri,
                    http_code = status.as_u16(),
                    business_code,
                    outcome = outcome.as_str(),
                    success,
                    cost_seconds,
                    trace_id = %trace_id,
                    user_id = ctx.user_id(),
                    trace_info = trace_info.as_deref(),
                    error = errors.as_deref(),
                    "interceptor"
                );
            }
        }

        (
            response,
            Assembled {
                outcome,
                status,
                cost_seconds,
            },
        )
    }
}

/// Merge the non-fatal errors and the abort cause into one line.
fn aggregate_errors(ctx: &RequestContext) -> Option<String> {
    let mut parts: Vec<String> = ctx.errors().iter().map(|e| e.to_string()).collect();
    if let Some(cause) = ctx.abort_error().and_then(|err| err.cause()) {
        parts.push(cause.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}
