//! Built-in endpoints mounted next to the application routes.
//!
//! The health check is an ordinary pipeline handler. The metrics and profiling
//! endpoints are plain axum routes served outside the pipeline, so they never
//! show up in request metrics or traces.
use std::sync::Arc;

use axum::{
    Router,
    extract::Path,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::{adapters::prometheus_sink::PrometheusMetricsSink, core::context::RequestContext};

pub const HEALTH_PATH: &str = "/system/health";
pub const METRICS_PATH: &str = "/metrics";
pub const PROFILING_PREFIX: &str = "/debug/pprof";

/// Profile names answered under [`PROFILING_PREFIX`].
pub const PROFILE_NAMES: &[&str] = &[
    "allocs",
    "block",
    "cmdline",
    "goroutine",
    "heap",
    "mutex",
    "profile",
    "symbol",
    "threadcreate",
    "trace",
];

#[derive(Debug, Serialize)]
struct HealthStatus {
    timestamp: String,
    host: String,
    status: &'static str,
}

/// `GET /system/health`: liveness answer routed through the full pipeline.
pub fn health_check<'a>(ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let status = HealthStatus {
            timestamp: chrono::Utc::now().to_rfc3339(),
            host: ctx.host().to_string(),
            status: "ok",
        };
        ctx.set_payload(&status);
    })
}

/// `GET /metrics` rendering the sink's registry in Prometheus text format.
pub fn metrics_endpoint(sink: Arc<PrometheusMetricsSink>) -> MethodRouter {
    get(move || {
        let sink = sink.clone();
        async move {
            (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                sink.render(),
            )
        }
    })
}

/// Routes under `/debug/pprof/`.
///
/// No sampling profiler is compiled in: the index and `cmdline` answer, every
/// other known profile reports 501.
pub fn profiling_router() -> Router {
    Router::new()
        .route(&format!("{PROFILING_PREFIX}/"), get(profiling_index))
        .route(&format!("{PROFILING_PREFIX}/{{name}}"), get(profile))
}

async fn profiling_index() -> String {
    let mut body = String::from("Available profiles:\n");
    for name in PROFILE_NAMES {
        body.push_str(&format!("{PROFILING_PREFIX}/{name}\n"));
    }
    body
}

async fn profile(Path(name): Path<String>) -> Response {
    match name.as_str() {
        "cmdline" => {
            let args: Vec<String> = std::env::args().collect();
            args.join("\0").into_response()
        }
        known if PROFILE_NAMES.contains(&known) => (
            StatusCode::NOT_IMPLEMENTED,
            format!("profile {known} is not available in this build"),
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
