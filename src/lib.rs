//! Portico - a per-request edge pipeline for axum services.
//!
//! Portico sits between the HTTP engine and application handlers. Every request
//! gets a pooled [`RequestContext`] and runs inside a panic boundary. It carries
//! a correlation id, passes a shared token-bucket admission gate, and ends with
//! exactly one metrics record, one trace record and one digest log line.
//!
//! # Features
//! - Pooled request contexts, reset and returned on every exit path
//! - Panic containment: a panicking handler yields `500 {code: 10001}` and an
//!   operator notification while the server keeps serving
//! - `X-Trace-Id` correlation: reused from the caller or generated
//! - Global token-bucket rate limiting (`429 {code: 10002}`)
//! - Dual error model: HTTP status plus business code/message body
//! - Prometheus metrics, optional CORS, health and profiling endpoints
//!
//! # Quick Example
//! ```no_run
//! use portico::{Pipeline, config::PipelineConfig};
//!
//! # fn main() -> eyre::Result<()> {
//! let mut pipeline = Pipeline::new(PipelineConfig::default())?;
//! pipeline.get("/hello/{name}", |ctx| {
//!     Box::pin(async move {
//!         let name = ctx.param("name").unwrap_or("world").to_string();
//!         ctx.set_payload(&serde_json::json!({ "hello": name }));
//!     })
//! });
//! let router: axum::Router = pipeline.into_router();
//! # let _ = router;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **Ports** (traits for metrics, traces, panic notification and the server)
//! are kept apart from **adapters** (Prometheus, log, webhook and axum
//! implementations); the pipeline itself lives in `core`.
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>` with `WrapErr` context. Request-level
//! failures never escape: they become a [`ClassifiedError`] on the context.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{AxumServer, PrometheusMetricsSink, WebhookNotifier},
    core::{
        ClassifiedError, Identity, Pipeline, PipelineBuilder, RequestContext, TokenBucket,
        alias_for_metrics, auth, disable_trace, handler_fn,
    },
    ports::http_server::HttpServer,
    utils::GracefulShutdown,
};
