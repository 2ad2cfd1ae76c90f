//! Tower service adapter in front of the dispatcher.

use crate::dispatch::{Dispatcher, ProxyBody};
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, instrument, warn};

const ALLOW_ORIGIN: &str = "*";
const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// HTTP service that load-balances requests across the configured endpoints.
///
/// Implements `tower::Service` for composability with Tower middleware.
/// Dispatch failures are turned into plain-text error responses carrying
/// the status of the underlying [`DispatchError`](crate::error::DispatchError).
///
/// # Example
///
/// ```no_run
/// use aphrodite_loadbalancer::config::{EndpointConfig, LoadBalancerConfig};
/// use aphrodite_loadbalancer::dispatch::Dispatcher;
/// use aphrodite_loadbalancer::service::ProxyService;
/// use std::sync::Arc;
///
/// let config = LoadBalancerConfig {
///     endpoints: vec![EndpointConfig::new("http://10.0.0.1:2242")],
///     ..Default::default()
/// };
/// let dispatcher = Arc::new(Dispatcher::from_config(&config).unwrap());
/// let service = ProxyService::new(dispatcher, config.cors);
/// ```
#[derive(Clone)]
pub struct ProxyService {
    dispatcher: Arc<Dispatcher>,
    cors: bool,
}

impl ProxyService {
    /// Creates a service over `dispatcher`.
    ///
    /// With `cors` set, `OPTIONS` requests are answered locally and every
    /// response carries permissive CORS headers.
    pub fn new(dispatcher: Arc<Dispatcher>, cors: bool) -> Self {
        Self { dispatcher, cors }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[instrument(level = "debug", skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if self.cors && req.method() == Method::OPTIONS {
            debug!("answering preflight request");
            let mut response = Response::new(empty_body());
            add_cors_headers(response.headers_mut());
            return response;
        }

        let mut response = match self.dispatcher.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "request failed");
                error_response(e.status_code(), &e.to_string())
            }
        };

        if self.cors {
            add_cors_headers(response.headers_mut());
        }
        response
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Creates a plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::BAD_GATEWAY, "all 2 attempts failed");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = error_response(StatusCode::NOT_FOUND, "no route for path: /x");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "no route for path: /x");
    }

    #[test]
    fn test_cors_headers() {
        let mut headers = HeaderMap::new();
        add_cors_headers(&mut headers);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type, Authorization"
        );
    }
}
