//! Error types for the load balancer.

use crate::config::ConfigError;
use http::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used for streaming bodies and transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while running the listeners.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for listener operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure of a single forwarding attempt against one endpoint.
///
/// These are recovered locally by retrying against another endpoint and only
/// reach the client wrapped in [`DispatchError::Exhausted`].
#[derive(Error, Debug)]
pub enum BackendError {
    /// The TCP connection to the endpoint could not be established.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect { endpoint: String, source: BoxError },

    /// The endpoint did not produce a response head in time.
    #[error("{endpoint} timed out after {}ms", after.as_millis())]
    Timeout { endpoint: String, after: Duration },

    /// The endpoint answered with a server error status.
    #[error("{endpoint} responded with {status}")]
    Status { endpoint: String, status: StatusCode },

    /// No connection slot to the endpoint became free in time.
    #[error("connection pool for {endpoint} exhausted")]
    PoolExhausted { endpoint: String },

    /// The exchange failed after the connection was established.
    #[error("exchange with {endpoint} failed: {source}")]
    Transport { endpoint: String, source: BoxError },
}

impl BackendError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Connect { .. } => "connect",
            BackendError::Timeout { .. } => "timeout",
            BackendError::Status { .. } => "status",
            BackendError::PoolExhausted { .. } => "pool_exhausted",
            BackendError::Transport { .. } => "transport",
        }
    }

    /// Whether this failure is charged to the endpoint's health.
    ///
    /// Pool exhaustion reflects local saturation, not endpoint ill-health.
    pub fn counts_against_endpoint(&self) -> bool {
        !matches!(self, BackendError::PoolExhausted { .. })
    }
}

/// Errors surfaced to the client by the dispatch path.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No endpoint is eligible for the request path.
    #[error("no route for path: {path}")]
    NoRoute { path: String },

    /// Every endpoint of the route group is unhealthy.
    #[error("no healthy endpoint for path: {path}")]
    NoHealthyEndpoint { path: String },

    /// Every allowed attempt failed.
    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: BackendError },

    /// The dispatcher no longer accepts new requests.
    #[error("load balancer is shutting down")]
    ShuttingDown,

    /// Reading the client's request body failed.
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] BoxError),

    /// The upstream URI could not be built for the request.
    #[error("invalid upstream uri: {0}")]
    InvalidUpstreamUri(String),
}

impl DispatchError {
    /// HTTP status returned to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::NoRoute { .. } => StatusCode::NOT_FOUND,
            DispatchError::NoHealthyEndpoint { .. } | DispatchError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Exhausted { .. } | DispatchError::InvalidUpstreamUri(_) => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::RequestBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_status_codes() {
        let no_route = DispatchError::NoRoute {
            path: "/x".to_string(),
        };
        assert_eq!(no_route.status_code(), StatusCode::NOT_FOUND);

        let unhealthy = DispatchError::NoHealthyEndpoint {
            path: "/x".to_string(),
        };
        assert_eq!(unhealthy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            DispatchError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let exhausted = DispatchError::Exhausted {
            attempts: 2,
            last: BackendError::Status {
                endpoint: "http://a".to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        assert_eq!(exhausted.status_code(), StatusCode::BAD_GATEWAY);
        assert!(exhausted.to_string().contains("all 2 attempts failed"));
    }

    #[test]
    fn test_pool_exhaustion_not_charged() {
        let err = BackendError::PoolExhausted {
            endpoint: "http://a".to_string(),
        };
        assert!(!err.counts_against_endpoint());
        assert_eq!(err.kind(), "pool_exhausted");

        let err = BackendError::Timeout {
            endpoint: "http://a".to_string(),
            after: Duration::from_millis(250),
        };
        assert!(err.counts_against_endpoint());
        assert_eq!(err.to_string(), "http://a timed out after 250ms");
    }
}
