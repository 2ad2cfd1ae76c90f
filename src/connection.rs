//! Per-endpoint connection limiting.
//!
//! Bounds the number of concurrent exchanges against each endpoint so a slow
//! backend cannot make the proxy open unbounded outbound connections. A
//! permit is held for the whole exchange, including the streamed response
//! body.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Connection limiter for a single endpoint.
#[derive(Debug)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    total_acquired: AtomicU64,
    total_timed_out: AtomicU64,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            active: Arc::new(AtomicUsize::new(0)),
            total_acquired: AtomicU64::new(0),
            total_timed_out: AtomicU64::new(0),
            max_connections,
        }
    }

    /// Attempts to acquire a permit without waiting.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.guard(permit))
    }

    /// Waits up to `wait` for a permit.
    ///
    /// Returns `None` if the limit stayed exhausted for the whole wait.
    pub async fn acquire(&self, wait: Duration) -> Option<ConnectionGuard> {
        match timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Some(self.guard(permit)),
            Ok(Err(_)) => None,
            Err(_) => {
                self.total_timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    max = self.max_connections,
                    wait_ms = wait.as_millis() as u64,
                    "connection limit reached"
                );
                None
            }
        }
    }

    fn guard(&self, permit: tokio::sync::OwnedSemaphorePermit) -> ConnectionGuard {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        debug!(active = active, "connection permit acquired");
        ConnectionGuard {
            _permit: permit,
            active: self.active.clone(),
        }
    }

    /// Returns the number of exchanges currently holding a permit.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.active.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_timed_out: self.total_timed_out.load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Guard that releases a connection permit when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(active = active, "connection permit released");
    }
}

/// Statistics about connection usage of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub total_acquired: u64,
    pub total_timed_out: u64,
    pub max_connections: usize,
}

/// One limiter per endpoint, indexed by configuration order.
#[derive(Debug)]
pub struct ConnectionPools {
    limiters: Vec<ConnectionLimiter>,
}

impl ConnectionPools {
    pub fn new(endpoint_count: usize, max_connections_per_endpoint: usize) -> Self {
        Self {
            limiters: (0..endpoint_count)
                .map(|_| ConnectionLimiter::new(max_connections_per_endpoint))
                .collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&ConnectionLimiter> {
        self.limiters.get(index)
    }

    /// Waits up to `wait` for a permit on the endpoint with configuration
    /// `index`.
    pub async fn acquire(&self, index: usize, wait: Duration) -> Option<ConnectionGuard> {
        self.limiters.get(index)?.acquire(wait).await
    }
}
