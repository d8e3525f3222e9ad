//! Configuration data structures for Portico.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. Every field has a
//! default so that an empty file yields a working server.
use serde::{Deserialize, Serialize};

/// Default burst size of the global token bucket.
pub const DEFAULT_RATE_LIMIT_CAPACITY: u32 = 100_000;

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_shutdown_timeout() -> String {
    "5s".to_string()
}

/// Token bucket sizing for the global admission gate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum burst (bucket size)
    pub capacity: u32,
    /// Tokens added per second; zero disables refill
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RATE_LIMIT_CAPACITY,
            refill_per_second: 1.0,
        }
    }
}

/// Options recognized by the request pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Answer CORS preflights and add CORS headers to every response
    pub enable_cors: bool,
    /// Run the global token bucket before every matched handler
    pub enable_rate_limit: bool,
    /// Suppress the per-request digest log line
    pub disable_structured_logger: bool,
    /// Emit the digest as a one-line summary instead of structured fields
    pub use_simple_log_line: bool,
    /// Webhook URL receiving a JSON report for every recovered panic
    pub panic_notify_hook: Option<String>,
    /// Record per-request metrics into the Prometheus sink
    pub record_metrics_hook: bool,
    /// Do not mount `/debug/pprof/*`
    pub disable_profiling_endpoints: bool,
    /// Do not mount `/metrics`
    pub disable_metrics_endpoint: bool,
    pub rate_limit: RateLimitConfig,
    /// Upper bound for the buffered request body
    pub max_body_bytes: usize,
    /// Number of idle request contexts kept for reuse
    pub context_pool_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_cors: false,
            enable_rate_limit: false,
            disable_structured_logger: false,
            use_simple_log_line: false,
            panic_notify_hook: None,
            record_metrics_hook: false,
            disable_profiling_endpoints: false,
            disable_metrics_endpoint: false,
            rate_limit: RateLimitConfig::default(),
            max_body_bytes: 2 * 1024 * 1024,
            context_pool_size: 1024,
        }
    }
}

/// Logging output settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "portico=debug,info"
    pub level: String,
    /// JSON lines instead of pretty console output
    pub json: bool,
    /// Attach span context to JSON lines
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Grace period for in-flight requests, humantime format ("5s", "1m")
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Parsed shutdown grace period.
    pub fn shutdown_timeout(&self) -> Result<std::time::Duration, humantime::DurationError> {
        humantime::parse_duration(&self.shutdown_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_timeout: default_shutdown_timeout(),
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.config.shutdown_timeout = timeout.into();
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.config.pipeline = pipeline;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
