use std::{future::IntoFuture, sync::Arc};

use axum::Router;
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;

use crate::{
    ports::http_server::HttpServer,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};

/// Serves a pipeline router with axum/hyper until shutdown is triggered.
pub struct AxumServer {
    router: Router,
    shutdown: Arc<GracefulShutdown>,
}

impl AxumServer {
    pub fn new(router: Router, shutdown: Arc<GracefulShutdown>) -> Self {
        Self { router, shutdown }
    }
}

impl HttpServer for AxumServer {
    fn serve(&self, listener: TcpListener) -> impl Future<Output = Result<()>> + Send {
        let router = self.router.clone();
        let mut drain_signal = self.shutdown.shutdown_token();
        let mut stop_accepting = self.shutdown.shutdown_token();
        let drain_timeout = self.shutdown.drain_timeout();

        async move {
            let local_addr = listener
                .local_addr()
                .wrap_err("Failed to read listener address")?;
            tracing::info!("Portico server listening on {}", local_addr);

            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let reason = stop_accepting.wait_for_shutdown().await;
                    tracing::info!("Stopping listener: {:?}", reason);
                })
                .into_future();
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => return result.wrap_err("Server terminated unexpectedly"),
                _ = drain_signal.wait_for_shutdown() => {}
            }

            match tokio::time::timeout(drain_timeout, serve).await {
                Ok(result) => {
                    result.wrap_err("Server failed while draining connections")?;
                    tracing::info!("Graceful shutdown completed");
                }
                Err(_) => tracing::warn!(
                    "Connections still open after {:?}, forcing shutdown",
                    drain_timeout
                ),
            }
            Ok(())
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdown.trigger_shutdown(ShutdownReason::Graceful);
        Ok(())
    }
}
