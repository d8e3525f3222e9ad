//! The per-request edge pipeline and its route table.
//!
//! Every routed request flows through [`PipelineCore::dispatch`]:
//!
//! 1. a [`RequestContext`] is taken from the pool and loaded with the request,
//! 2. inside the [`PanicGuard`] boundary the trace id is fixed, the shared
//!    [`TokenBucket`] admits or rejects, and the handler chain runs until it
//!    finishes or a handler aborts,
//! 3. a recovered panic is contained,
//! 4. the [`ResponseAssembler`] writes the response, records metrics, finishes
//!    the trace and logs the digest line,
//! 5. the context goes back to the pool when its guard drops, on every exit
//!    path including a dropped request future.
//!
//! Unmatched paths and methods skip step 2 entirely.
use std::{any::Any, collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{FromRequestParts, MatchedPath, RawPathParams, Request},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
};
use bytes::Bytes;
use eyre::{Result, WrapErr};
use futures_util::future::BoxFuture;
use http::Method;
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Instrument;

use crate::{
    adapters::{
        http_handler::{
            HEALTH_PATH, METRICS_PATH, PROFILING_PREFIX, health_check, metrics_endpoint,
            profiling_router,
        },
        log_trace_sink::LogTraceSink,
        middleware::cors_middleware,
        prometheus_sink::PrometheusMetricsSink,
        webhook_notifier::WebhookNotifier,
    },
    config::models::PipelineConfig,
    core::{
        assembler::{DigestMode, ResponseAssembler, RouteMatch},
        context::RequestContext,
        error::{BusinessCode, ClassifiedError},
        guard::{PanicGuard, panic_message},
        handler::{BoxedHandler, handler_fn},
        pool::ContextPool,
        rate_limiter::TokenBucket,
        trace::TraceCorrelator,
    },
    ports::{metrics_sink::MetricsSink, notifier::PanicNotifier, trace_sink::TraceSink},
    tracing_setup::create_request_span,
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared per-pipeline state used by every request.
pub struct PipelineCore {
    pool: Arc<ContextPool>,
    guard: PanicGuard,
    assembler: ResponseAssembler,
    rate_limiter: Option<Arc<TokenBucket>>,
    max_body_bytes: usize,
}

impl PipelineCore {
    /// Run one request through the pipeline.
    pub async fn dispatch(
        &self,
        request: Request,
        route: RouteMatch,
        chain: &[BoxedHandler],
    ) -> Response {
        let started = Instant::now();
        let span = create_request_span(request.method().as_str(), request.uri().path());
        self.handle(request, route, chain, started)
            .instrument(span)
            .await
    }

    async fn handle(
        &self,
        request: Request,
        route: RouteMatch,
        chain: &[BoxedHandler],
        started: Instant,
    ) -> Response {
        let (mut parts, body) = request.into_parts();
        let matched_path = parts
            .extensions
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_string());
        let params = if route == RouteMatch::Matched {
            match RawPathParams::from_request_parts(&mut parts, &()).await {
                Ok(raw) => raw
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                Err(e) => {
                    tracing::debug!("Path parameters unavailable: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let body = axum::body::to_bytes(body, self.max_body_bytes).await;

        let mut ctx = self.pool.acquire();
        let body_error = match body {
            Ok(bytes) => {
                ctx.prepare(parts, bytes, matched_path, params);
                None
            }
            Err(e) => {
                ctx.prepare(parts, Bytes::new(), matched_path, params);
                Some(e)
            }
        };
        if let Some(e) = body_error {
            ctx.abort(
                ClassifiedError::new(
                    413,
                    BusinessCode::ParamBindError.code(),
                    "Request body too large or unreadable",
                )
                .with_cause(e),
            );
        }

        let fault = if route == RouteMatch::Matched {
            self.guard.run(self.run_chain(&mut ctx, chain)).await.err()
        } else {
            ctx.disable_trace();
            None
        };
        if let Some(fault) = &fault {
            self.guard.contain(&mut ctx, fault);
        }

        let (response, assembled) =
            self.assembler
                .assemble(&mut ctx, route, fault.as_ref(), started);

        let span = tracing::Span::current();
        span.record("http.status_code", assembled.status.as_u16());
        span.record("outcome", assembled.outcome.as_str());
        #[allow(clippy::cast_possible_truncation)]
        span.record("duration_ms", started.elapsed().as_millis() as u64);

        response
    }

    async fn run_chain(&self, ctx: &mut RequestContext, chain: &[BoxedHandler]) {
        self.assembler.tracer().begin(ctx);
        if let Some(id) = ctx.trace_id() {
            tracing::Span::current().record("trace.id", id);
        }

        if ctx.is_aborted() {
            return;
        }

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow() {
                tracing::warn!(path = %ctx.path(), "Rate limit exceeded");
                ctx.abort(ClassifiedError::too_many_requests());
                return;
            }
        }

        for handler in chain {
            handler.call(ctx).await;
            if ctx.is_aborted() {
                break;
            }
        }
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    pub fn rate_limiter(&self) -> Option<&Arc<TokenBucket>> {
        self.rate_limiter.as_ref()
    }
}

/// Assembles a [`Pipeline`] from configuration plus optional collaborators.
///
/// Anything not injected is derived from the [`PipelineConfig`]: the webhook
/// notifier from `panic_notify_hook`, the Prometheus sink from
/// `record_metrics_hook`, the token bucket from `enable_rate_limit`.
pub struct PipelineBuilder {
    config: PipelineConfig,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    notifier: Option<Arc<dyn PanicNotifier>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    rate_limiter: Option<Arc<TokenBucket>>,
    prometheus: Option<Arc<PrometheusMetricsSink>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            metrics_sink: None,
            notifier: None,
            trace_sink: None,
            rate_limiter: None,
            prometheus: None,
        }
    }

    /// Record metrics here instead of (not in addition to) the Prometheus sink.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn panic_notifier(mut self, notifier: Arc<dyn PanicNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    /// Use this bucket for admission control, regardless of `enable_rate_limit`.
    pub fn rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn prometheus(mut self, sink: Arc<PrometheusMetricsSink>) -> Self {
        self.prometheus = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;

        let prometheus = match self.prometheus {
            Some(sink) => sink,
            None => Arc::new(PrometheusMetricsSink::new()?),
        };

        let metrics_sink = self.metrics_sink.or_else(|| {
            config
                .record_metrics_hook
                .then(|| prometheus.clone() as Arc<dyn MetricsSink>)
        });

        let notifier = match (self.notifier, &config.panic_notify_hook) {
            (Some(notifier), _) => Some(notifier),
            (None, Some(url)) => {
                tracing::info!("Panic notifications will be posted to {}", url);
                let webhook = WebhookNotifier::new(url.clone(), WEBHOOK_TIMEOUT)
                    .wrap_err("Failed to set up panic notification webhook")?;
                Some(Arc::new(webhook) as Arc<dyn PanicNotifier>)
            }
            (None, None) => None,
        };

        let trace_sink = self
            .trace_sink
            .unwrap_or_else(|| Arc::new(LogTraceSink) as Arc<dyn TraceSink>);

        let rate_limiter = self.rate_limiter.or_else(|| {
            config
                .enable_rate_limit
                .then(|| Arc::new(TokenBucket::from_config(&config.rate_limit)))
        });

        let core = PipelineCore {
            pool: Arc::new(ContextPool::new(config.context_pool_size)),
            guard: PanicGuard::new(notifier),
            assembler: ResponseAssembler::new(
                metrics_sink,
                TraceCorrelator::new(Some(trace_sink)),
                DigestMode::from_config(&config),
            ),
            rate_limiter,
            max_body_bytes: config.max_body_bytes,
        };

        let mut pipeline = Pipeline {
            core: Arc::new(core),
            routes: BTreeMap::new(),
            config,
            prometheus,
        };
        pipeline.get(HEALTH_PATH, health_check);

        Ok(pipeline)
    }
}

struct RouteEntry {
    method: Method,
    chain: Arc<[BoxedHandler]>,
}

/// Route table plus the shared pipeline state.
///
/// Paths use axum's syntax (`/users/{name}`). Register everything, then turn
/// the pipeline into an [`axum::Router`] with [`Pipeline::into_router`].
pub struct Pipeline {
    core: Arc<PipelineCore>,
    routes: BTreeMap<String, Vec<RouteEntry>>,
    config: PipelineConfig,
    prometheus: Arc<PrometheusMetricsSink>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        PipelineBuilder::new(config).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn core(&self) -> &Arc<PipelineCore> {
        &self.core
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn prometheus(&self) -> &Arc<PrometheusMetricsSink> {
        &self.prometheus
    }

    /// Register a single handler for `method` on `path`.
    pub fn register<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register_chain(method, path, vec![handler_fn(handler)])
    }

    /// Register handlers run in order; the chain stops at the first abort.
    ///
    /// Registering the same method and path again replaces the earlier chain.
    pub fn register_chain(
        &mut self,
        method: Method,
        path: &str,
        chain: Vec<BoxedHandler>,
    ) -> &mut Self {
        if MethodFilter::try_from(method.clone()).is_err() {
            tracing::warn!("Method {} cannot be routed, skipping {}", method, path);
            return self;
        }
        if self.is_reserved(path) {
            tracing::warn!("Path {} is served by a built-in endpoint, skipping", path);
            return self;
        }

        let entries = self.routes.entry(path.to_string()).or_default();
        let chain: Arc<[BoxedHandler]> = chain.into();
        match entries.iter_mut().find(|entry| entry.method == method) {
            Some(entry) => {
                tracing::warn!("Route {} {} registered twice, replacing", method, path);
                entry.chain = chain;
            }
            None => entries.push(RouteEntry { method, chain }),
        }
        self
    }

    /// Paths owned by the enabled `/metrics` and profiling endpoints.
    fn is_reserved(&self, path: &str) -> bool {
        let metrics = !self.config.disable_metrics_endpoint && path == METRICS_PATH;
        let profiling = !self.config.disable_profiling_endpoints
            && path
                .strip_prefix(PROFILING_PREFIX)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        metrics || profiling
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::GET, path, handler)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::POST, path, handler)
    }

    pub fn put<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::PUT, path, handler)
    }

    pub fn patch<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::PATCH, path, handler)
    }

    pub fn delete<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::DELETE, path, handler)
    }

    /// Register routes under a common path prefix.
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            pipeline: self,
            prefix: normalize_prefix(prefix),
        }
    }

    /// Registered `(method, path)` pairs, sorted by path.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.routes
            .iter()
            .flat_map(|(path, entries)| {
                entries
                    .iter()
                    .map(move |entry| (entry.method.clone(), path.clone()))
            })
            .collect()
    }

    /// Build the axum router serving every registered route through the
    /// pipeline, plus the metrics and profiling endpoints unless disabled.
    pub fn into_router(self) -> Router {
        let mut router = Router::new();

        for (path, entries) in self.routes {
            let mut method_router = MethodRouter::new();
            for RouteEntry { method, chain } in entries {
                let Ok(filter) = MethodFilter::try_from(method) else {
                    continue;
                };
                let core = self.core.clone();
                method_router = method_router.on(filter, move |request: Request| {
                    let core = core.clone();
                    let chain = chain.clone();
                    async move { core.dispatch(request, RouteMatch::Matched, &chain).await }
                });
            }

            let core = self.core.clone();
            method_router = method_router.fallback(move |request: Request| {
                let core = core.clone();
                async move {
                    core.dispatch(request, RouteMatch::MethodNotAllowed, &[])
                        .await
                }
            });

            router = router.route(&path, method_router);
        }

        let core = self.core.clone();
        router = router.fallback(move |request: Request| {
            let core = core.clone();
            async move { core.dispatch(request, RouteMatch::NotFound, &[]).await }
        });

        if !self.config.disable_metrics_endpoint {
            router = router.route(METRICS_PATH, metrics_endpoint(self.prometheus.clone()));
        }
        if !self.config.disable_profiling_endpoints {
            router = router.merge(profiling_router());
        }
        if self.config.enable_cors {
            router = router.layer(from_fn(cors_middleware));
        }

        router.layer(CatchPanicLayer::custom(escaped_panic_response))
    }
}

/// Routes sharing a path prefix; see [`Pipeline::group`].
pub struct RouteGroup<'p> {
    pipeline: &'p mut Pipeline,
    prefix: String,
}

impl RouteGroup<'_> {
    fn full_path(&self, path: &str) -> String {
        if path.is_empty() || path == "/" {
            if self.prefix.is_empty() {
                "/".to_string()
            } else {
                self.prefix.clone()
            }
        } else if path.starts_with('/') {
            format!("{}{}", self.prefix, path)
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    pub fn register<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        let full = self.full_path(path);
        self.pipeline.register(method, &full, handler);
        self
    }

    pub fn register_chain(
        &mut self,
        method: Method,
        path: &str,
        chain: Vec<BoxedHandler>,
    ) -> &mut Self {
        let full = self.full_path(path);
        self.pipeline.register_chain(method, &full, chain);
        self
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::GET, path, handler)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::POST, path, handler)
    }

    pub fn put<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::PUT, path, handler)
    }

    pub fn patch<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::PATCH, path, handler)
    }

    pub fn delete<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.register(Method::DELETE, path, handler)
    }

    /// Nested group below this one.
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        let prefix = format!("{}{}", self.prefix, normalize_prefix(prefix));
        RouteGroup {
            pipeline: &mut *self.pipeline,
            prefix,
        }
    }
}

/// `"api/"` and `"/api"` both become `"/api"`; `"/"` becomes `""`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn escaped_panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(
        panic = %panic_message(payload.as_ref()),
        "panic escaped the request pipeline"
    );
    ClassifiedError::server_error().into_response()
}
