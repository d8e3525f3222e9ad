use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::future::BoxFuture;
use portico::{
    AxumServer, ClassifiedError, GracefulShutdown, HttpServer, Identity, Pipeline,
    RequestContext, alias_for_metrics, auth,
    config::{ServerConfig, ServerConfigValidator, loader::load_config},
    handler_fn, tracing_setup,
};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "portico.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "portico.toml")]
        config: String,
    },
    /// Write a default configuration file
    Init {
        #[clap(short, long, default_value = "portico.toml")]
        config: String,
    },
    /// Start the server with the demo routes (default)
    Serve {
        #[clap(short, long, default_value = "portico.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = if Path::new(config_path).exists() {
        load_config(config_path)
            .await
            .with_context(|| format!("Failed to load config from {config_path}"))?
    } else {
        ServerConfig::default()
    };

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    if !Path::new(config_path).exists() {
        tracing::warn!("{} not found, using built-in defaults", config_path);
    }

    ServerConfigValidator::validate(&config).context("Invalid configuration")?;

    let shutdown_timeout = config
        .shutdown_timeout()
        .context("Invalid shutdown_timeout")?;
    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(shutdown_timeout));

    let mut pipeline =
        Pipeline::new(config.pipeline.clone()).context("Failed to build request pipeline")?;
    register_demo_routes(&mut pipeline);
    for (method, path) in pipeline.routes() {
        tracing::info!("Route registered: {} {}", method, path);
    }

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let server = AxumServer::new(pipeline.into_router(), graceful_shutdown);
    server.serve(listener).await?;

    tracing::info!("Portico stopped");
    Ok(())
}

#[derive(Debug, Deserialize, Serialize)]
struct EchoRequest {
    message: String,
    #[serde(default)]
    repeat: Option<u8>,
}

fn echo<'a>(ctx: &'a mut RequestContext) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let request: EchoRequest = match ctx.bind_json() {
            Ok(request) => request,
            Err(err) => return ctx.abort(err),
        };
        let times = usize::from(request.repeat.unwrap_or(1));
        ctx.trace_debug("repeat", serde_json::json!(times));
        ctx.set_payload(&serde_json::json!({ "echo": request.message.repeat(times) }));
    })
}

fn resolve_token<'a>(ctx: &'a RequestContext) -> BoxFuture<'a, Result<Identity, ClassifiedError>> {
    Box::pin(async move {
        match ctx
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
        {
            Some("demo-token") => Ok(Identity {
                user_id: 1,
                user_name: "demo".to_string(),
            }),
            _ => Err(ClassifiedError::new(401, 10104, "Unauthorized")),
        }
    })
}

fn register_demo_routes(pipeline: &mut Pipeline) {
    let mut demo = pipeline.group("/demo");

    demo.get("/hello", |ctx| {
        Box::pin(async move {
            ctx.set_payload(&serde_json::json!({ "hello": "world" }));
        })
    });

    // no payload: 200 with an empty body
    demo.get("/hi", |_ctx| Box::pin(async move {}));

    demo.register_chain(
        http::Method::GET,
        "/users/{name}",
        vec![
            alias_for_metrics("/demo/users/{name}"),
            handler_fn(|ctx| {
                Box::pin(async move {
                    let name = ctx.param("name").unwrap_or_default().to_string();
                    ctx.set_payload(&serde_json::json!({ "name": name }));
                })
            }),
        ],
    );

    demo.post("/echo", echo);

    demo.register_chain(
        http::Method::GET,
        "/me",
        vec![
            auth(resolve_token),
            handler_fn(|ctx| {
                Box::pin(async move {
                    let body = serde_json::json!({
                        "user_id": ctx.user_id(),
                        "user_name": ctx.user_name(),
                    });
                    ctx.set_payload(&body);
                })
            }),
        ],
    );

    demo.get("/panic", |ctx| {
        Box::pin(async move {
            // out of bounds on purpose: exercises panic containment
            let items: Vec<u32> = Vec::new();
            let index = ctx.path().len();
            ctx.set_payload(&items[index]);
        })
    });
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Rate Limit: {}", config.pipeline.enable_rate_limit);
            println!("   • CORS: {}", config.pipeline.enable_cors);
            println!(
                "   • Panic Webhook: {}",
                config.pipeline.panic_notify_hook.as_deref().unwrap_or("none")
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   • Use a humantime duration for shutdown_timeout (e.g., '5s')");
            println!("   • Ensure the panic webhook starts with http:// or https://");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Portico configuration

listen_addr = "127.0.0.1:8080"
shutdown_timeout = "5s"

[logging]
level = "info"
json = true
include_spans = true

[pipeline]
enable_cors = false
enable_rate_limit = true
use_simple_log_line = false
disable_structured_logger = false
record_metrics_hook = true
disable_metrics_endpoint = false
disable_profiling_endpoints = false
# panic_notify_hook = "https://hooks.example.com/portico"
max_body_bytes = 2097152
context_pool_size = 1024

[pipeline.rate_limit]
capacity = 100000
refill_per_second = 1.0
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the server");
    Ok(())
}
