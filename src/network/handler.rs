//! Standalone server mounting the proxy

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::proxy::ApiCache;
use crate::Result;

use super::SHUTDOWN_TIMEOUT_MS;

/// Accepts HTTP/1 connections and hands every request to the proxy
pub struct NetworkHandler {
    proxy: Arc<ApiCache>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a new network handler
    #[must_use]
    pub fn new(proxy: ApiCache) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            proxy: Arc::new(proxy),
            shutdown_tx,
        }
    }

    /// Sender that stops [`NetworkHandler::serve`] when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured listen address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.proxy.config().listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until SIGINT or a shutdown signal
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "Listening on {} (proxy to {})",
            listener.local_addr()?,
            self.proxy.config().api_url
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_signal = async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
            }
        };
        tokio::pin!(shutdown_signal);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = &mut shutdown_signal => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            connections.spawn(serve_connection(stream, Arc::clone(&self.proxy)));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        // In-flight requests get a grace period, the rest are aborted on drop
        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        info!("Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, proxy: Arc<ApiCache>) {
    let service = service_fn(move |request: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.handle(request).await.to_response()) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection error: {}", e);
    }
}
