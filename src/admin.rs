//! Admin endpoints for health, metrics, and endpoint status.

use crate::dispatch::{Dispatcher, ProxyBody};
use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service for monitoring the load balancer.
///
/// Serves:
/// - `/health` - 200 while at least one endpoint is healthy, 503 otherwise
/// - `/metrics` - Prometheus metrics in text format
/// - `/endpoints` - JSON snapshot of every endpoint's health and weight
#[derive(Clone)]
pub struct AdminService {
    dispatcher: Arc<Dispatcher>,
}

impl AdminService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        Ok(self.respond(req.uri().path()))
    }

    fn respond(&self, path: &str) -> Response<ProxyBody> {
        match path {
            "/health" => {
                debug!("health check requested");
                self.health_response()
            }
            "/metrics" => {
                debug!("metrics requested");
                match self.dispatcher.encode_metrics() {
                    Ok(metrics) => {
                        Self::response(StatusCode::OK, "text/plain; version=0.0.4", metrics)
                    }
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        Self::text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                    }
                }
            }
            "/endpoints" => {
                debug!("endpoint status requested");
                match serde_json::to_string(&self.dispatcher.endpoint_status()) {
                    Ok(json) => Self::response(StatusCode::OK, "application/json", json),
                    Err(e) => {
                        warn!("failed to serialize endpoint status: {}", e);
                        Self::text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to serialize endpoint status",
                        )
                    }
                }
            }
            _ => Self::text(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn health_response(&self) -> Response<ProxyBody> {
        let registry = self.dispatcher.registry();
        let healthy = registry.healthy_count();
        if self.dispatcher.is_shutting_down() {
            Self::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
        } else if healthy == 0 {
            Self::text(StatusCode::SERVICE_UNAVAILABLE, "no healthy endpoints")
        } else {
            Self::text(
                StatusCode::OK,
                &format!("healthy ({}/{} endpoints)", healthy, registry.len()),
            )
        }
    }

    fn text(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Self::response(status, "text/plain; charset=utf-8", message.to_string())
    }

    fn response(status: StatusCode, content_type: &str, body: String) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(
                Full::new(Bytes::from(body))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::new())
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(self.clone().handle_request(req))
    }
}
