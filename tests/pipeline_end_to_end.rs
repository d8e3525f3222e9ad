use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use portico::{
    ClassifiedError, Identity, Pipeline, RequestContext, TokenBucket, alias_for_metrics, auth,
    config::PipelineConfig,
    core::{TRACE_HEADER, TraceRecord},
    handler_fn,
    ports::{
        metrics_sink::{MetricsSink, RequestMetrics},
        notifier::{NotifyError, PanicNotifier, PanicReport},
        trace_sink::TraceSink,
    },
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingMetrics(Mutex<Vec<RequestMetrics>>);

impl MetricsSink for RecordingMetrics {
    fn record(&self, metrics: &RequestMetrics) {
        self.0.lock().push(metrics.clone());
    }
}

#[derive(Default)]
struct CollectingTraces(Mutex<Vec<TraceRecord>>);

impl TraceSink for CollectingTraces {
    fn push(&self, record: TraceRecord) {
        self.0.lock().push(record);
    }
}

#[derive(Default)]
struct CountingNotifier {
    reports: Mutex<Vec<PanicReport>>,
}

#[async_trait]
impl PanicNotifier for CountingNotifier {
    async fn notify(&self, report: &PanicReport) -> Result<(), NotifyError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

struct Harness {
    pipeline: Pipeline,
    metrics: Arc<RecordingMetrics>,
    traces: Arc<CollectingTraces>,
    notifier: Arc<CountingNotifier>,
}

fn harness(config: PipelineConfig) -> Harness {
    harness_with_limiter(config, None)
}

fn harness_with_limiter(config: PipelineConfig, limiter: Option<Arc<TokenBucket>>) -> Harness {
    let metrics = Arc::new(RecordingMetrics::default());
    let traces = Arc::new(CollectingTraces::default());
    let notifier = Arc::new(CountingNotifier::default());

    let mut builder = Pipeline::builder(config)
        .metrics_sink(metrics.clone())
        .trace_sink(traces.clone())
        .panic_notifier(notifier.clone());
    if let Some(limiter) = limiter {
        builder = builder.rate_limiter(limiter);
    }

    Harness {
        pipeline: builder.build().unwrap(),
        metrics,
        traces,
        notifier,
    }
}

fn ok_handler<'a>(ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        ctx.set_payload(&serde_json::json!({ "ok": true }));
    })
}

fn exploding_handler<'a>(ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let items: Vec<u32> = Vec::new();
        let index = ctx.path().len();
        ctx.set_payload(&items[index]);
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

/// Wait briefly for work spawned off the request path.
async fn settle(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn json(body: &Bytes) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn health_route_answers_through_pipeline() {
    let h = harness(PipelineConfig::default());
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .uri("/system/health")
        .header(header::HOST, "api.local")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["host"], "api.local");
    assert!(body["timestamp"].as_str().is_some());

    // exempt from tracing, still counted
    assert!(!headers.contains_key(TRACE_HEADER));
    assert!(h.traces.0.lock().is_empty());
    let metrics = h.metrics.0.lock();
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].success);
    assert!(metrics[0].trace_id.is_empty());
}

#[tokio::test]
async fn bind_failure_yields_param_bind_error() {
    #[derive(serde::Deserialize)]
    #[allow(dead_code)]
    struct NewOrder {
        sku: String,
        quantity: u32,
    }

    let mut h = harness(PipelineConfig::default());
    h.pipeline.post("/orders", |ctx| {
        Box::pin(async move {
            match ctx.bind_json::<NewOrder>() {
                Ok(_) => ctx.set_payload(&"created"),
                Err(err) => ctx.abort(err),
            }
        })
    });
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"sku\": 12"))
        .unwrap();
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        json(&body),
        serde_json::json!({ "code": 10103, "message": "Invalid request parameters" })
    );

    let metrics = h.metrics.0.lock();
    assert!(!metrics[0].success);
    assert_eq!(metrics[0].business_code, 10103);
}

#[tokio::test]
async fn panic_is_contained_and_server_keeps_serving() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.get("/boom", exploding_handler);
    h.pipeline.get("/ok", ok_handler);
    let router = h.pipeline.into_router();

    let (status, headers, body) = send(&router, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json(&body),
        serde_json::json!({ "code": 10001, "message": "Internal Server Error" })
    );
    assert!(headers.contains_key(TRACE_HEADER));

    settle(|| !h.notifier.reports.lock().is_empty()).await;
    {
        let reports = h.notifier.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].uri, "/boom");
        assert!(reports[0].message.contains("index out of bounds"));
        assert_eq!(
            reports[0].trace_id,
            headers[TRACE_HEADER].to_str().unwrap()
        );
    }

    let (status, _, body) = send(&router, get("/ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), serde_json::json!({ "ok": true }));
    assert_eq!(h.notifier.reports.lock().len(), 1);
}

struct SlowNotifier {
    delay: Duration,
    delivered: AtomicUsize,
}

#[async_trait]
impl PanicNotifier for SlowNotifier {
    async fn notify(&self, _report: &PanicReport) -> Result<(), NotifyError> {
        tokio::time::sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn slow_notifier_does_not_delay_panic_response() {
    let notifier = Arc::new(SlowNotifier {
        delay: Duration::from_millis(600),
        delivered: AtomicUsize::new(0),
    });
    let mut pipeline = Pipeline::builder(PipelineConfig::default())
        .panic_notifier(notifier.clone())
        .build()
        .unwrap();
    pipeline.get("/boom", exploding_handler);
    let router = pipeline.into_router();

    let started = Instant::now();
    let (status, _, _) = send(&router, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(notifier.delivered.load(Ordering::SeqCst), 0);

    settle(|| notifier.delivered.load(Ordering::SeqCst) == 1).await;
    assert_eq!(notifier.delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn trace_id_is_generated_or_reused() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.get("/ok", ok_handler);
    let router = h.pipeline.into_router();

    let (_, headers, _) = send(&router, get("/ok")).await;
    let generated = headers[TRACE_HEADER].to_str().unwrap().to_string();
    assert_eq!(generated.len(), 32);

    let request = Request::builder()
        .uri("/ok")
        .header(TRACE_HEADER, "  caller-trace-7  ")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = send(&router, request).await;
    assert_eq!(headers[TRACE_HEADER], "caller-trace-7");

    let traces = h.traces.0.lock();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].id, generated);
    assert_eq!(traces[1].id, "caller-trace-7");
    let request = traces[1].request.as_ref().unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.ttl, "un-limit");
    let response = traces[1].response.as_ref().unwrap();
    assert_eq!(response.http_status, 200);
    assert!(traces[1].success);
}

#[tokio::test]
async fn exempt_route_produces_no_trace() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.get("/favicon.ico", |ctx| {
        Box::pin(async move {
            ctx.trace_debug("ignored", serde_json::json!(true));
            ctx.set_payload(&"icon");
        })
    });
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .uri("/favicon.ico")
        .header(TRACE_HEADER, "should-not-echo")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(!headers.contains_key(TRACE_HEADER));
    assert!(h.traces.0.lock().is_empty());
}

#[tokio::test]
async fn single_slot_pool_does_not_leak_identity() {
    let config = PipelineConfig {
        context_pool_size: 1,
        ..PipelineConfig::default()
    };
    let mut h = harness(config);
    let pool = h.pipeline.core().pool().clone();

    fn from_header<'a>(
        ctx: &'a RequestContext,
    ) -> BoxFuture<'a, Result<Identity, ClassifiedError>> {
        Box::pin(async move {
            match ctx
                .header("x-user")
                .and_then(|value| value.parse::<i64>().ok())
            {
                Some(user_id) => Ok(Identity {
                    user_id,
                    user_name: format!("user-{user_id}"),
                }),
                None => Err(ClassifiedError::new(401, 10104, "Unauthorized")),
            }
        })
    }

    fn whoami<'a>(ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = serde_json::json!({
                "user_id": ctx.user_id(),
                "user_name": ctx.user_name(),
                "alias": ctx.alias(),
            });
            ctx.set_payload(&body);
        })
    }

    h.pipeline.register_chain(
        Method::GET,
        "/login",
        vec![
            alias_for_metrics("/login-alias"),
            auth(from_header),
            handler_fn(whoami),
        ],
    );
    h.pipeline.get("/whoami", whoami);
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .uri("/login")
        .header("x-user", "7")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["user_id"], 7);
    assert_eq!(pool.idle_count(), 1);

    let (status, _, body) = send(&router, get("/whoami")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["user_id"], 0);
    assert_eq!(body["user_name"], "");
    assert!(body["alias"].is_null());
    assert_eq!(pool.idle_count(), 1);

    let (status, _, body) = send(&router, get("/login")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json(&body)["code"], 10104);
}

#[tokio::test]
async fn rate_limiter_rejects_after_capacity() {
    let handled = Arc::new(AtomicUsize::new(0));
    let limiter = Arc::new(TokenBucket::new(3, 0.0));
    let mut h = harness_with_limiter(PipelineConfig::default(), Some(limiter.clone()));

    let counter = handled.clone();
    h.pipeline.get("/limited", move |ctx| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.set_payload(&"admitted");
        })
    });
    let router = h.pipeline.into_router();

    // unmatched requests do not consume tokens
    let (status, _, _) = send(&router, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    for _ in 0..3 {
        let (status, _, _) = send(&router, get("/limited")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _, body) = send(&router, get("/limited")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json(&body),
        serde_json::json!({ "code": 10002, "message": "Too Many Requests" })
    );
    assert_eq!(handled.load(Ordering::SeqCst), 3);
    assert!(!limiter.allow());
}

#[tokio::test]
async fn abort_wins_over_payload_and_stops_chain() {
    let later_ran = Arc::new(AtomicUsize::new(0));
    let mut h = harness(PipelineConfig::default());

    let counter = later_ran.clone();
    h.pipeline.register_chain(
        Method::PUT,
        "/orders/{id}",
        vec![
            handler_fn(|ctx| {
                Box::pin(async move {
                    ctx.set_payload(&serde_json::json!({ "id": 1 }));
                    ctx.abort(ClassifiedError::new(409, 20001, "Order already exists"));
                })
            }),
            handler_fn(move |ctx| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.set_payload(&"overwritten");
                })
            }),
        ],
    );
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/orders/1")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        json(&body),
        serde_json::json!({ "code": 20001, "message": "Order already exists" })
    );
    assert_eq!(later_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unmatched_route_and_method_have_no_body() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.get("/ok", ok_handler);
    let router = h.pipeline.into_router();

    let (status, headers, body) = send(&router, get("/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.is_empty());
    assert!(!headers.contains_key(TRACE_HEADER));

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/ok")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(body.is_empty());

    let metrics = h.metrics.0.lock();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].http_status, 404);
    assert_eq!(metrics[0].uri, "/missing");
    assert!(!metrics[0].success);
    assert_eq!(metrics[1].http_status, 405);
    assert!(h.traces.0.lock().is_empty());
}

#[tokio::test]
async fn metrics_uri_is_form_decoded() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.get("/search", ok_handler);
    let router = h.pipeline.into_router();

    let (status, _, _) = send(&router, get("/search?q=a+b%20c")).await;
    assert_eq!(status, StatusCode::OK);

    let metrics = h.metrics.0.lock();
    assert_eq!(metrics[0].uri, "/search?q=a b c");
    let traces = h.traces.0.lock();
    let request = traces[0].request.as_ref().unwrap();
    assert_eq!(request.decoded_url, "/search?q=a b c");
}

#[tokio::test]
async fn alias_groups_metrics() {
    let mut h = harness(PipelineConfig::default());
    h.pipeline.register_chain(
        Method::GET,
        "/users/{name}",
        vec![
            alias_for_metrics("/users/:name"),
            handler_fn(|ctx| {
                Box::pin(async move {
                    let name = ctx.param("name").unwrap_or_default().to_string();
                    ctx.set_payload(&serde_json::json!({ "name": name }));
                })
            }),
        ],
    );
    let router = h.pipeline.into_router();

    let (_, _, body) = send(&router, get("/users/ana")).await;
    assert_eq!(json(&body)["name"], "ana");
    send(&router, get("/users/bo")).await;

    let metrics = h.metrics.0.lock();
    assert_eq!(metrics.len(), 2);
    assert!(metrics.iter().all(|m| m.uri == "/users/:name"));
}

#[tokio::test]
async fn cors_preflight_is_answered_before_pipeline() {
    let config = PipelineConfig {
        enable_cors: true,
        ..PipelineConfig::default()
    };
    let mut h = harness(config);
    h.pipeline.post("/orders", ok_handler);
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/orders")
        .header(header::ORIGIN, "https://shop.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&router, request).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://shop.example.com"
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(h.metrics.0.lock().is_empty());
}

#[tokio::test]
async fn metrics_endpoint_renders_recorded_requests() {
    let config = PipelineConfig {
        record_metrics_hook: true,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(config).unwrap();
    pipeline.get("/ok", ok_handler);
    let router = pipeline.into_router();

    send(&router, get("/ok")).await;
    let (status, _, body) = send(&router, get("/metrics")).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("portico_requests_total"));
    assert!(text.contains("uri=\"/ok\""));
    assert!(!text.contains("uri=\"/metrics\""));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = PipelineConfig {
        max_body_bytes: 8,
        ..PipelineConfig::default()
    };
    let handled = Arc::new(AtomicUsize::new(0));
    let mut h = harness(config);
    let counter = handled.clone();
    h.pipeline.post("/upload", move |ctx| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.set_payload(&"stored");
        })
    });
    let router = h.pipeline.into_router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let (status, _, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json(&body)["code"], 10103);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_token_is_cancelled_after_completion() {
    let captured: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let mut h = harness(PipelineConfig::default());

    let slot = captured.clone();
    h.pipeline.get("/work", move |ctx| {
        let slot = slot.clone();
        Box::pin(async move {
            let token = ctx.cancellation();
            assert!(!token.is_cancelled());
            *slot.lock() = Some(token);
            ctx.push_error(eyre::eyre!("cache unavailable, served from origin"));
            ctx.set_payload(&"done");
        })
    });
    let router = h.pipeline.into_router();

    let (status, _, _) = send(&router, get("/work")).await;
    assert_eq!(status, StatusCode::OK);

    let token = captured.lock().take().unwrap();
    assert!(token.is_cancelled());
    assert!(h.metrics.0.lock()[0].success);
}
