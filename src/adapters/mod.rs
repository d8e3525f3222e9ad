pub mod axum_server;
pub mod http_handler;
pub mod log_trace_sink;
pub mod middleware;
pub mod prometheus_sink;
pub mod webhook_notifier;

pub use axum_server::AxumServer;
pub use log_trace_sink::LogTraceSink;
pub use middleware::cors_middleware;
pub use prometheus_sink::PrometheusMetricsSink;
pub use webhook_notifier::WebhookNotifier;
