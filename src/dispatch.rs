//! Request forwarding with retry and failover.
//!
//! The [`Dispatcher`] owns all shared load-balancing state (registry,
//! router, scheduler cursors, health tracker, connection limiters) and runs
//! the per-request flow:
//!
//! 1. Resolve the route group for the request path.
//! 2. Pick an endpoint, excluding those already tried for this request.
//! 3. Forward the request with its body streamed through a replay buffer.
//! 4. Relay a non-failing response head and stream its body to the client,
//!    or record the failure and go back to step 2 while attempts remain.
//!
//! Every request produces one [`DispatchEvent`] on completion, including
//! requests abandoned by the client.

use crate::body::{DeadlineBody, GuardedBody, ReplayBody};
use crate::config::{ConfigError, LoadBalancerConfig};
use crate::connection::ConnectionPools;
use crate::endpoint::{Endpoint, EndpointRegistry, EndpointStatus};
use crate::error::{BackendError, BoxError, DispatchError};
use crate::health::HealthTracker;
use crate::metrics::Metrics;
use crate::retry::RetryConfig;
use crate::router::PathRouter;
use crate::scheduler::WeightedScheduler;
use http::header::{HeaderName, CONNECTION, HOST};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body::Body;
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout_at;
use tracing::{debug, info, instrument, warn};

/// Body type of responses relayed to clients.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

type UpstreamBody = ReplayBody<UnsyncBoxBody<Bytes, BoxError>>;

/// Headers that describe a single transport hop and are never forwarded.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const EVENT_CAPACITY: usize = 1024;

/// Tunables for the forwarding engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounds TCP connect and the wait for a connection slot.
    pub connect_timeout: Duration,
    /// Bounds a whole attempt, up to the last byte of the response body.
    pub request_timeout: Duration,
    /// Whether a 5xx response is treated as a failed attempt.
    pub failover_on_5xx: bool,
    pub retry: RetryConfig,
    pub health: HealthTracker,
    pub max_connections_per_endpoint: usize,
    pub pool_max_idle_per_endpoint: usize,
    pub pool_idle_timeout: Duration,
    /// Request body bytes retained for retries.
    pub max_replay_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&LoadBalancerConfig::default())
    }
}

impl From<&LoadBalancerConfig> for DispatchConfig {
    fn from(config: &LoadBalancerConfig) -> Self {
        let retry = match config.max_attempts {
            Some(cap) => RetryConfig::new().with_max_attempts(cap),
            None => RetryConfig::new(),
        };
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            failover_on_5xx: config.failover_on_5xx,
            retry,
            health: HealthTracker::new(config.failure_threshold, config.cooldown()),
            max_connections_per_endpoint: config.max_connections_per_endpoint,
            pool_max_idle_per_endpoint: config.pool_max_idle_per_endpoint,
            pool_idle_timeout: config.pool_idle_timeout(),
            max_replay_bytes: config.max_replay_bytes,
        }
    }
}

/// Final outcome kind of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// A response head was relayed to the client.
    Success,
    NoRoute,
    NoHealthyEndpoint,
    /// Every allowed attempt failed.
    Exhausted,
    ShuttingDown,
    /// The client's own request body failed.
    RequestBody,
    InvalidUpstreamUri,
    /// The client went away before a response was relayed.
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NoRoute => "no_route",
            Outcome::NoHealthyEndpoint => "no_healthy_endpoint",
            Outcome::Exhausted => "exhausted",
            Outcome::ShuttingDown => "shutting_down",
            Outcome::RequestBody => "request_body",
            Outcome::InvalidUpstreamUri => "invalid_upstream_uri",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl From<&DispatchError> for Outcome {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::NoRoute { .. } => Outcome::NoRoute,
            DispatchError::NoHealthyEndpoint { .. } => Outcome::NoHealthyEndpoint,
            DispatchError::Exhausted { .. } => Outcome::Exhausted,
            DispatchError::ShuttingDown => Outcome::ShuttingDown,
            DispatchError::RequestBody(_) => Outcome::RequestBody,
            DispatchError::InvalidUpstreamUri(_) => Outcome::InvalidUpstreamUri,
        }
    }
}

/// Side-channel notification emitted once per client request.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub path: String,
    /// Endpoint of the last attempt, if any attempt was made.
    pub endpoint: Option<String>,
    pub attempts: u32,
    pub outcome: Outcome,
    /// Status sent to the client; `None` if the client went away.
    pub status: Option<StatusCode>,
    /// Time until the response head was relayed or the request failed.
    pub latency: Duration,
}

/// Failure of one attempt, as seen by the retry loop.
enum AttemptError {
    /// Recoverable by trying another endpoint.
    Backend(BackendError),
    /// Ends the request.
    Fatal(DispatchError),
}

impl From<BackendError> for AttemptError {
    fn from(err: BackendError) -> Self {
        AttemptError::Backend(err)
    }
}

impl From<DispatchError> for AttemptError {
    fn from(err: DispatchError) -> Self {
        AttemptError::Fatal(err)
    }
}

/// Forwarding engine shared by every connection.
pub struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    router: PathRouter,
    scheduler: WeightedScheduler,
    pools: ConnectionPools,
    client: Client<HttpConnector, UpstreamBody>,
    config: DispatchConfig,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<DispatchEvent>,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
}

impl Dispatcher {
    /// Creates a dispatcher over an already validated registry.
    pub fn new(registry: Arc<EndpointRegistry>, config: DispatchConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_endpoint)
            .pool_idle_timeout(config.pool_idle_timeout)
            .build(connector);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            router: PathRouter::new(&registry),
            scheduler: WeightedScheduler::new(),
            pools: ConnectionPools::new(registry.len(), config.max_connections_per_endpoint),
            registry,
            client,
            config,
            metrics: Arc::new(Metrics::new()),
            events,
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Validates `config` and builds the registry and dispatcher from it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration or any endpoint
    /// descriptor is invalid.
    pub fn from_config(config: &LoadBalancerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(EndpointRegistry::new(&config.endpoints)?);
        Ok(Self::new(registry, DispatchConfig::from(config)))
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &PathRouter {
        &self.router
    }

    pub fn health(&self) -> &HealthTracker {
        &self.config.health
    }

    pub fn pools(&self) -> &ConnectionPools {
        &self.pools
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Subscribes to per-request outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Stops admitting new requests. In-flight exchanges are left to finish.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!(
                in_flight = self.in_flight(),
                "dispatcher no longer accepting requests"
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Requests currently being dispatched.
    ///
    /// A request stops counting once its response head has been relayed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of every endpoint, including its connection slot usage.
    pub fn endpoint_status(&self) -> Vec<EndpointStatus> {
        self.registry
            .iter()
            .map(|endpoint| EndpointStatus {
                connections: self.pools.get(endpoint.index()).map(|l| l.stats()),
                ..endpoint.status()
            })
            .collect()
    }

    /// Refreshes endpoint gauges and encodes all metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        self.metrics.observe_endpoints(&self.registry, &self.pools);
        self.metrics.encode()
    }

    /// Forwards `req` to an endpoint of its route group.
    ///
    /// The returned response streams the backend's body; the connection
    /// slot is released once that body is finished or dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] when no response can be relayed; its
    /// [`status_code`](DispatchError::status_code) is what the client
    /// should see.
    #[instrument(level = "debug", skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn dispatch<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, DispatchError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut record = DispatchRecord::new(self, req.uri().path());
        let result = self.forward(req, &mut record).await;
        match &result {
            Ok(resp) => record.finish(Outcome::Success, resp.status()),
            Err(e) => record.finish(Outcome::from(e), e.status_code()),
        }
        result
    }

    async fn forward<B>(
        &self,
        req: Request<B>,
        record: &mut DispatchRecord<'_>,
    ) -> Result<Response<ProxyBody>, DispatchError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }

        let path = req.uri().path().to_string();
        let group = self.router.route(&path)?;

        let (parts, body) = req.into_parts();
        let body: UpstreamBody = ReplayBody::new(
            body.map_err(Into::into).boxed_unsync(),
            self.config.max_replay_bytes,
        );

        let mut budget = self.config.retry.budget(group.len());
        let mut last_error: Option<BackendError> = None;

        while budget.has_remaining() {
            if self.is_shutting_down() {
                return Err(DispatchError::ShuttingDown);
            }

            let attempt = match self.scheduler.select(
                &group,
                &self.config.health,
                budget.excluded(),
                &path,
            ) {
                Ok(attempt) => attempt,
                Err(e) => match last_error {
                    Some(_) => break,
                    None => return Err(e),
                },
            };

            let Some(attempt_body) = body.try_clone() else {
                debug!(path = %path, "request body no longer replayable");
                break;
            };

            let endpoint = attempt.endpoint().clone();
            budget.record_attempt(endpoint.index());
            record.attempted(&endpoint);

            match self.exchange(&endpoint, &parts, attempt_body).await {
                Ok(response) => {
                    attempt.succeed();
                    return Ok(response);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Backend(err)) => {
                    if body.source_failed() {
                        debug!(endpoint = %endpoint.url(), error = %err, "client body failed");
                        return Err(DispatchError::RequestBody(Box::new(err)));
                    }

                    warn!(
                        endpoint = %endpoint.url(),
                        attempt = budget.attempts(),
                        max_attempts = budget.max_attempts(),
                        kind = err.kind(),
                        error = %err,
                        "attempt failed"
                    );
                    self.metrics.record_failure(endpoint.url(), err.kind());
                    if err.counts_against_endpoint() {
                        attempt.fail();
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last) => Err(DispatchError::Exhausted {
                attempts: budget.attempts(),
                last,
            }),
            None => Err(DispatchError::NoHealthyEndpoint { path }),
        }
    }

    /// Runs one exchange against `endpoint`, up to the response head.
    ///
    /// The relayed body keeps the attempt's deadline. Running past it ends
    /// the client stream and charges the endpoint a failure, since the
    /// response is already committed and cannot be retried.
    async fn exchange(
        &self,
        endpoint: &Arc<Endpoint>,
        parts: &Parts,
        body: UpstreamBody,
    ) -> Result<Response<ProxyBody>, AttemptError> {
        let limit = self.config.request_timeout;
        let deadline = tokio::time::Instant::now() + limit;
        let uri = upstream_uri(endpoint, &parts.uri)?;

        let guard = self
            .pools
            .acquire(endpoint.index(), self.config.connect_timeout)
            .await
            .ok_or_else(|| BackendError::PoolExhausted {
                endpoint: endpoint.url().to_string(),
            })?;

        let mut req = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| DispatchError::InvalidUpstreamUri(e.to_string()))?;
        *req.headers_mut() = forwarded_headers(&parts.headers, endpoint.host_header());

        debug!(endpoint = %endpoint.url(), uri = %req.uri(), "forwarding request");

        let response = match timeout_at(deadline, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_connect() => {
                return Err(BackendError::Connect {
                    endpoint: endpoint.url().to_string(),
                    source: Box::new(e),
                }
                .into())
            }
            Ok(Err(e)) => {
                return Err(BackendError::Transport {
                    endpoint: endpoint.url().to_string(),
                    source: Box::new(e),
                }
                .into())
            }
            Err(_) => {
                return Err(BackendError::Timeout {
                    endpoint: endpoint.url().to_string(),
                    after: limit,
                }
                .into())
            }
        };

        let status = response.status();
        if status.is_server_error() && self.config.failover_on_5xx {
            return Err(BackendError::Status {
                endpoint: endpoint.url().to_string(),
                status,
            }
            .into());
        }

        let (mut head, incoming) = response.into_parts();
        strip_hop_headers(&mut head.headers);

        let on_expired = {
            let endpoint = endpoint.clone();
            let health = self.config.health.clone();
            let metrics = self.metrics.clone();
            move || {
                let err = BackendError::Timeout {
                    endpoint: endpoint.url().to_string(),
                    after: limit,
                };
                warn!(endpoint = %endpoint.url(), error = %err, "response body timed out");
                metrics.record_failure(endpoint.url(), err.kind());
                health.record_failure(&endpoint);
            }
        };
        let body = DeadlineBody::new(GuardedBody::new(incoming, guard), deadline, limit)
            .on_expired(on_expired);
        Ok(Response::from_parts(head, body.boxed()))
    }

    fn emit(&self, event: DispatchEvent) {
        let status = event.status.map(|s| s.as_u16()).unwrap_or(0);
        info!(
            path = %event.path,
            endpoint = event.endpoint.as_deref().unwrap_or("-"),
            attempts = event.attempts,
            outcome = event.outcome.as_str(),
            status = status,
            latency_ms = event.latency.as_secs_f64() * 1000.0,
            "request completed"
        );
        self.metrics.record_request(
            event.endpoint.as_deref(),
            event.outcome.as_str(),
            status,
            event.attempts,
            event.latency,
        );
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Tracks one request and emits its event exactly once.
///
/// If the dispatch future is dropped first, the event is emitted from
/// `Drop` as [`Outcome::Cancelled`].
struct DispatchRecord<'a> {
    dispatcher: &'a Dispatcher,
    path: String,
    started: Instant,
    attempts: u32,
    endpoint: Option<String>,
    finished: bool,
}

impl<'a> DispatchRecord<'a> {
    fn new(dispatcher: &'a Dispatcher, path: &str) -> Self {
        dispatcher.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            dispatcher,
            path: path.to_string(),
            started: Instant::now(),
            attempts: 0,
            endpoint: None,
            finished: false,
        }
    }

    fn attempted(&mut self, endpoint: &Endpoint) {
        self.attempts += 1;
        self.endpoint = Some(endpoint.url().to_string());
    }

    fn finish(&mut self, outcome: Outcome, status: StatusCode) {
        self.emit(outcome, Some(status));
    }

    fn emit(&mut self, outcome: Outcome, status: Option<StatusCode>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.dispatcher.emit(DispatchEvent {
            path: std::mem::take(&mut self.path),
            endpoint: self.endpoint.take(),
            attempts: self.attempts,
            outcome,
            status,
            latency: self.started.elapsed(),
        });
    }
}

impl Drop for DispatchRecord<'_> {
    fn drop(&mut self) {
        self.emit(Outcome::Cancelled, None);
        self.dispatcher.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builds the upstream URI: endpoint base URL + request path + query.
fn upstream_uri(endpoint: &Endpoint, original: &Uri) -> Result<Uri, DispatchError> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}{}", endpoint.url(), path_and_query)
        .parse()
        .map_err(|e: http::uri::InvalidUri| DispatchError::InvalidUpstreamUri(e.to_string()))
}

/// Copies end-to-end request headers and points `Host` at the endpoint.
fn forwarded_headers(original: &HeaderMap, host: &HeaderValue) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_headers(&mut headers);
    headers.insert(HOST, host.clone());
    headers
}

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub(crate) fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}
