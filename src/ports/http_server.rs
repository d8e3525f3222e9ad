use eyre::Result;
use tokio::net::TcpListener;

/// HttpServer defines the port for the engine serving the pipeline
pub trait HttpServer: Send + Sync + 'static {
    /// Serve connections accepted on `listener` until shutdown is requested
    ///
    /// # Returns
    /// A future that resolves when the server has drained or failed
    fn serve(&self, listener: TcpListener) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Ask a running server to stop accepting connections and drain
    fn shutdown(&self) -> Result<()>;
}
