//! Passive and active endpoint health tracking.
//!
//! Each endpoint moves between two states:
//! - **Healthy**: eligible for every selection
//! - **Unhealthy**: excluded, until its cooldown elapses; then exactly one
//!   request at a time is let through as a half-open probe, and the
//!   outcome of that probe decides whether the endpoint recovers
//!
//! Live traffic feeds the tracker through [`Attempt`] leases handed out by
//! the scheduler. The optional [`HealthProber`] feeds it through the same
//! leases from a background task.

use crate::config::HealthCheckConfig;
use crate::endpoint::{Endpoint, EndpointRegistry};
use http::Request;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Mutable health fields of an endpoint.
///
/// Read by anyone, written only through [`HealthTracker`].
#[derive(Debug)]
pub struct EndpointHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    probing: AtomicBool,
}

impl EndpointHealth {
    pub(crate) fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            probing: AtomicBool::new(false),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether a half-open probe is currently in flight.
    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    fn cooled_down(&self, cooldown: Duration, now: Instant) -> bool {
        match *self.last_failure.lock() {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        }
    }
}

/// Policy that updates endpoint health from exchange outcomes.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    failure_threshold: u32,
    cooldown: Duration,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(10))
    }
}

impl HealthTracker {
    /// Creates a tracker that marks an endpoint unhealthy after
    /// `failure_threshold` consecutive failures and re-admits it for a
    /// half-open attempt after `cooldown`.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether the endpoint may be picked right now.
    ///
    /// Evaluated on every selection; nothing is cached.
    pub fn is_selectable(&self, endpoint: &Endpoint, now: Instant) -> bool {
        let health = endpoint.health();
        health.is_healthy() || (!health.is_probing() && health.cooled_down(self.cooldown, now))
    }

    /// Leases the endpoint for one exchange.
    ///
    /// Healthy endpoints are always admitted. An unhealthy endpoint is
    /// admitted only once its cooldown has elapsed and no other probe holds
    /// it; the returned lease is then a half-open probe.
    pub fn admit(&self, endpoint: &Arc<Endpoint>, now: Instant) -> Option<Attempt> {
        let health = endpoint.health();
        if health.is_healthy() {
            return Some(Attempt::new(endpoint.clone(), self.clone(), false));
        }

        if !health.cooled_down(self.cooldown, now) {
            return None;
        }

        health
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        info!(endpoint = %endpoint.url(), "half-open probe admitted");
        Some(Attempt::new(endpoint.clone(), self.clone(), true))
    }

    /// Resets the failure counter and marks the endpoint healthy.
    pub fn record_success(&self, endpoint: &Endpoint) {
        let health = endpoint.health();
        health.consecutive_failures.store(0, Ordering::Release);
        *health.last_failure.lock() = None;
        let was_healthy = health.healthy.swap(true, Ordering::AcqRel);

        if !was_healthy {
            info!(endpoint = %endpoint.url(), "endpoint recovered");
        }
    }

    /// Counts a failure, marking the endpoint unhealthy at the threshold.
    ///
    /// A failure of an already unhealthy endpoint restarts its cooldown.
    pub fn record_failure(&self, endpoint: &Endpoint) {
        let health = endpoint.health();
        let failures = health.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        *health.last_failure.lock() = Some(Instant::now());

        if failures >= self.failure_threshold && health.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                endpoint = %endpoint.url(),
                failures = failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "endpoint marked unhealthy"
            );
        } else {
            debug!(
                endpoint = %endpoint.url(),
                failures = failures,
                "endpoint failure recorded"
            );
        }
    }
}

/// Lease on an endpoint for a single exchange.
///
/// Settle it with [`succeed`](Attempt::succeed) or [`fail`](Attempt::fail).
/// Dropping an unsettled lease (the client went away, or the failure is not
/// attributable to the endpoint) leaves the health counters untouched.
/// Only a probe lease owns the half-open slot, and it frees the slot when it
/// is settled or dropped.
#[derive(Debug)]
#[must_use]
pub struct Attempt {
    endpoint: Arc<Endpoint>,
    tracker: HealthTracker,
    probe: bool,
    settled: bool,
}

impl Attempt {
    fn new(endpoint: Arc<Endpoint>, tracker: HealthTracker, probe: bool) -> Self {
        Self {
            endpoint,
            tracker,
            probe,
            settled: false,
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Whether this lease is a half-open probe of an unhealthy endpoint.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.tracker.record_success(&self.endpoint);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.tracker.record_failure(&self.endpoint);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.probe {
            return;
        }
        // Settling has already updated the counters, so the next probe
        // observes the restarted cooldown.
        self.endpoint
            .health()
            .probing
            .store(false, Ordering::Release);
        if !self.settled {
            debug!(endpoint = %self.endpoint.url(), "half-open probe released");
        }
    }
}

/// Background task that actively probes unhealthy endpoints.
///
/// Complements the passive half-open path: an endpoint that receives no
/// traffic still recovers once its health path answers with a 2xx.
pub struct HealthProber {
    registry: Arc<EndpointRegistry>,
    tracker: HealthTracker,
    client: Client<HttpConnector, Empty<Bytes>>,
    config: HealthCheckConfig,
}

impl HealthProber {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        tracker: HealthTracker,
        config: HealthCheckConfig,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout()));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            registry,
            tracker,
            client,
            config,
        }
    }

    /// Runs probe rounds until a shutdown signal is received.
    #[instrument(level = "info", skip_all, fields(path = %self.config.path))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval_ms,
            "active health checking enabled"
        );

        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_round().await,
                _ = shutdown_rx.recv() => {
                    info!("stopping health prober");
                    break;
                }
            }
        }
    }

    /// Probes every unhealthy endpoint that is due for a half-open attempt.
    pub async fn probe_round(&self) {
        let now = Instant::now();
        for endpoint in self.registry.iter() {
            if endpoint.health().is_healthy() {
                continue;
            }
            if let Some(attempt) = self.tracker.admit(endpoint, now) {
                if self.probe(endpoint).await {
                    attempt.succeed();
                } else {
                    attempt.fail();
                }
            }
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let uri = format!("{}{}", endpoint.url(), self.config.path);
        let req = match Request::get(&uri)
            .header(http::header::HOST, endpoint.host_header().clone())
            .body(Empty::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(uri = %uri, error = %e, "failed to build health probe");
                return false;
            }
        };

        match timeout(self.config.timeout(), self.client.request(req)).await {
            Ok(Ok(resp)) if resp.status().is_success() => true,
            Ok(Ok(resp)) => {
                debug!(uri = %uri, status = resp.status().as_u16(), "health probe failed");
                false
            }
            Ok(Err(e)) => {
                debug!(uri = %uri, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(uri = %uri, "health probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    fn registry(n: usize) -> Arc<EndpointRegistry> {
        let configs: Vec<_> = (0..n)
            .map(|i| EndpointConfig::new(format!("http://host{}:8080", i)))
            .collect();
        Arc::new(EndpointRegistry::new(&configs).unwrap())
    }

    #[test]
    fn test_threshold_marks_unhealthy() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(3, Duration::from_secs(60));

        tracker.record_failure(endpoint);
        tracker.record_failure(endpoint);
        assert!(endpoint.health().is_healthy());
        assert_eq!(endpoint.health().consecutive_failures(), 2);

        tracker.record_failure(endpoint);
        assert!(!endpoint.health().is_healthy());
        assert_eq!(endpoint.health().consecutive_failures(), 3);
        assert!(!tracker.is_selectable(endpoint, Instant::now()));
        assert!(tracker.admit(endpoint, Instant::now()).is_none());
    }

    #[test]
    fn test_success_resets_counter() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(3, Duration::from_secs(60));

        tracker.record_failure(endpoint);
        tracker.record_failure(endpoint);
        tracker.record_success(endpoint);
        assert_eq!(endpoint.health().consecutive_failures(), 0);

        tracker.record_failure(endpoint);
        tracker.record_failure(endpoint);
        assert!(endpoint.health().is_healthy());
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(1, Duration::from_millis(50));

        tracker.record_failure(endpoint);
        let failed_at = Instant::now();
        assert!(!tracker.is_selectable(endpoint, failed_at));

        let later = failed_at + Duration::from_millis(100);
        assert!(tracker.is_selectable(endpoint, later));

        let probe = tracker.admit(endpoint, later).unwrap();
        assert!(probe.is_probe());

        // Only one probe at a time.
        assert!(!tracker.is_selectable(endpoint, later));
        assert!(tracker.admit(endpoint, later).is_none());

        probe.succeed();
        assert!(endpoint.health().is_healthy());
        assert_eq!(endpoint.health().consecutive_failures(), 0);
        assert!(!endpoint.health().is_probing());
    }

    #[test]
    fn test_failed_probe_restarts_cooldown() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(1, Duration::from_millis(50));

        tracker.record_failure(endpoint);
        let later = Instant::now() + Duration::from_millis(100);
        let probe = tracker.admit(endpoint, later).unwrap();
        probe.fail();

        assert!(!endpoint.health().is_healthy());
        assert_eq!(endpoint.health().consecutive_failures(), 2);
        assert!(!tracker.is_selectable(endpoint, Instant::now()));
    }

    #[test]
    fn test_dropped_probe_frees_slot() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(1, Duration::from_millis(10));

        tracker.record_failure(endpoint);
        let later = Instant::now() + Duration::from_millis(50);
        let probe = tracker.admit(endpoint, later).unwrap();
        drop(probe);

        assert!(!endpoint.health().is_probing());
        assert_eq!(endpoint.health().consecutive_failures(), 1);
        assert!(tracker.admit(endpoint, later).is_some());
    }

    #[test]
    fn test_stale_lease_keeps_half_open_slot() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(1, Duration::from_millis(10));

        // Leased while healthy, settled after the endpoint went half-open.
        let stale = tracker.admit(endpoint, Instant::now()).unwrap();
        assert!(!stale.is_probe());

        tracker.record_failure(endpoint);
        let later = Instant::now() + Duration::from_millis(50);
        let probe = tracker.admit(endpoint, later).unwrap();
        assert!(probe.is_probe());

        stale.fail();
        assert!(endpoint.health().is_probing());
        let much_later = later + Duration::from_millis(50);
        assert!(tracker.admit(endpoint, much_later).is_none());
        assert!(!tracker.is_selectable(endpoint, much_later));

        probe.fail();
        assert!(!endpoint.health().is_probing());
    }

    #[test]
    fn test_direct_record_keeps_half_open_slot() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::new(1, Duration::from_millis(10));

        tracker.record_failure(endpoint);
        let later = Instant::now() + Duration::from_millis(50);
        let probe = tracker.admit(endpoint, later).unwrap();

        tracker.record_failure(endpoint);
        assert!(endpoint.health().is_probing());
        drop(probe);
        assert!(!endpoint.health().is_probing());
    }

    #[test]
    fn test_healthy_lease_is_not_probe() {
        let registry = registry(1);
        let endpoint = registry.get(0).unwrap();
        let tracker = HealthTracker::default();

        let attempt = tracker.admit(endpoint, Instant::now()).unwrap();
        assert!(!attempt.is_probe());
        assert_eq!(attempt.endpoint().index(), 0);
        drop(attempt);
        assert_eq!(endpoint.health().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_prober_marks_unreachable_endpoint_failed() {
        let registry = Arc::new(
            EndpointRegistry::new(&[EndpointConfig::new("http://127.0.0.1:1")]).unwrap(),
        );
        let endpoint = registry.get(0).unwrap().clone();
        let tracker = HealthTracker::new(1, Duration::from_millis(1));
        tracker.record_failure(&endpoint);

        tokio::time::sleep(Duration::from_millis(5)).await;

        let config = HealthCheckConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        let prober = HealthProber::new(registry, tracker, config);
        prober.probe_round().await;

        assert!(!endpoint.health().is_healthy());
        assert_eq!(endpoint.health().consecutive_failures(), 2);
        assert!(!endpoint.health().is_probing());
    }
}
