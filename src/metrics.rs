//! Prometheus metrics collection and export.

use crate::connection::ConnectionPools;
use crate::endpoint::EndpointRegistry;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::fmt;
use std::time::Duration;

/// Label used when a request never reached an endpoint.
pub const NO_ENDPOINT: &str = "none";

/// Labels for per-request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Endpoint that produced the final outcome, or `none`.
    pub endpoint: String,
    /// Outcome kind (`success`, `exhausted`, ...).
    pub outcome: String,
    /// Status code sent to the client, `0` if none was sent.
    pub status: String,
}

/// Labels for per-attempt failure metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub endpoint: String,
    /// Failure kind (`connect`, `timeout`, `status`, ...).
    pub kind: String,
}

/// Labels for per-endpoint gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

/// Metrics collector for the load balancer.
///
/// Owned by the dispatcher and shared with the admin surface; there is no
/// process-global registry.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    attempts_per_request: Histogram,
    endpoint_failures_total: Family<FailureLabels, Counter>,
    endpoint_healthy: Family<EndpointLabels, Gauge>,
    endpoint_consecutive_failures: Family<EndpointLabels, Gauge>,
    endpoint_active_requests: Family<EndpointLabels, Gauge>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a collector with every metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("lb");

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "requests",
            "Total number of client requests by final outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "request_duration_seconds",
            "Time until the response head was relayed or the request failed",
            request_duration_seconds.clone(),
        );

        let attempts_per_request = Histogram::new([1.0, 2.0, 3.0, 4.0, 6.0, 8.0].into_iter());
        registry.register(
            "attempts_per_request",
            "Backend attempts made per client request",
            attempts_per_request.clone(),
        );

        let endpoint_failures_total = Family::<FailureLabels, Counter>::default();
        registry.register(
            "endpoint_failures",
            "Failed backend attempts by endpoint and kind",
            endpoint_failures_total.clone(),
        );

        let endpoint_healthy = Family::<EndpointLabels, Gauge>::default();
        registry.register(
            "endpoint_healthy",
            "Whether the endpoint is currently healthy (1) or not (0)",
            endpoint_healthy.clone(),
        );

        let endpoint_consecutive_failures = Family::<EndpointLabels, Gauge>::default();
        registry.register(
            "endpoint_consecutive_failures",
            "Consecutive failures recorded against the endpoint",
            endpoint_consecutive_failures.clone(),
        );

        let endpoint_active_requests = Family::<EndpointLabels, Gauge>::default();
        registry.register(
            "endpoint_active_requests",
            "Exchanges currently holding a connection slot on the endpoint",
            endpoint_active_requests.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            attempts_per_request,
            endpoint_failures_total,
            endpoint_healthy,
            endpoint_consecutive_failures,
            endpoint_active_requests,
        }
    }

    /// Records the final outcome of one client request.
    pub fn record_request(
        &self,
        endpoint: Option<&str>,
        outcome: &str,
        status: u16,
        attempts: u32,
        latency: Duration,
    ) {
        let labels = RequestLabels {
            endpoint: endpoint.unwrap_or(NO_ENDPOINT).to_string(),
            outcome: outcome.to_string(),
            status: status.to_string(),
        };

        self.requests_total.get_or_create(&labels).inc();
        self.request_duration_seconds
            .get_or_create(&labels)
            .observe(latency.as_secs_f64());
        if attempts > 0 {
            self.attempts_per_request.observe(f64::from(attempts));
        }
    }

    /// Records one failed backend attempt.
    pub fn record_failure(&self, endpoint: &str, kind: &str) {
        self.endpoint_failures_total
            .get_or_create(&FailureLabels {
                endpoint: endpoint.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    /// Copies current endpoint health and connection usage into the gauges.
    pub fn observe_endpoints(&self, registry: &EndpointRegistry, pools: &ConnectionPools) {
        for endpoint in registry.iter() {
            let labels = EndpointLabels {
                endpoint: endpoint.url().to_string(),
            };
            let health = endpoint.health();
            self.endpoint_healthy
                .get_or_create(&labels)
                .set(i64::from(health.is_healthy()));
            self.endpoint_consecutive_failures
                .get_or_create(&labels)
                .set(i64::from(health.consecutive_failures()));
            if let Some(limiter) = pools.get(endpoint.index()) {
                self.endpoint_active_requests
                    .get_or_create(&labels)
                    .set(limiter.active_connections() as i64);
            }
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
