//! Client-facing TCP listener.
//!
//! Accepts HTTP/1.1 connections and serves each on its own task through a
//! [`ProxyService`]. On shutdown the accept loop stops, idle keep-alive
//! connections are closed, and in-flight exchanges get up to the drain
//! timeout to finish streaming.

use crate::error::{ProxyError, Result};
use crate::service::ProxyService;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, info, instrument, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP listener that accepts connections and spawns handler tasks.
///
/// # Example
///
/// ```no_run
/// use aphrodite_loadbalancer::config::{EndpointConfig, LoadBalancerConfig};
/// use aphrodite_loadbalancer::dispatch::Dispatcher;
/// use aphrodite_loadbalancer::listener::Listener;
/// use aphrodite_loadbalancer::service::ProxyService;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = LoadBalancerConfig {
///         endpoints: vec![EndpointConfig::new("http://127.0.0.1:2242")],
///         ..Default::default()
///     };
///     let dispatcher = Arc::new(Dispatcher::from_config(&config)?);
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let listener = Listener::bind("127.0.0.1:8080", ProxyService::new(dispatcher, true)).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener {
    tcp_listener: TcpListener,
    proxy_service: ProxyService,
    addr: SocketAddr,
    drain_timeout: Duration,
}

impl Listener {
    /// Binds to the specified address and creates a listener.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(proxy_service))]
    pub async fn bind(addr: &str, proxy_service: ProxyService) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("bound to {} (HTTP/1.1)", local_addr);

        Ok(Self {
            tcp_listener,
            proxy_service,
            addr: local_addr,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Sets how long open connections may keep running after shutdown.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received,
    /// then drains open connections.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let _ = stream.set_nodelay(true);
                            let service = self.proxy_service.clone();
                            let service = service_fn(move |req: Request<Incoming>| {
                                let mut svc = service.clone();
                                async move { svc.call(req).await }
                            });

                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn);

                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("{}", ProxyError::AcceptConnection(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        drop(self.tcp_listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("all connections drained");
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "drain timeout elapsed, abandoning open connections"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, LoadBalancerConfig};
    use crate::dispatch::Dispatcher;
    use std::sync::Arc;

    fn service() -> ProxyService {
        let config = LoadBalancerConfig {
            endpoints: vec![EndpointConfig::new("http://127.0.0.1:9999")],
            ..Default::default()
        };
        ProxyService::new(Arc::new(Dispatcher::from_config(&config).unwrap()), true)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind() {
        let listener = Listener::bind("127.0.0.1:0", service()).await;
        assert!(listener.is_ok());
        assert_ne!(listener.unwrap().local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_bind_invalid_address() {
        let listener = Listener::bind("999.999.999.999:0", service()).await;
        assert!(listener.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_stops_on_shutdown() {
        let listener = Listener::bind("127.0.0.1:0", service())
            .await
            .unwrap()
            .with_drain_timeout(Duration::from_millis(100));
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(listener.serve(shutdown_tx.subscribe()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
