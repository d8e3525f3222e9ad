pub mod http_server;
pub mod metrics_sink;
pub mod notifier;
pub mod trace_sink;
