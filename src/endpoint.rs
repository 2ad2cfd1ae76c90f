//! Backend endpoint registry.
//!
//! The registry is built once from configuration and never changes shape
//! afterwards. The only mutable state on an [`Endpoint`] is its
//! [`EndpointHealth`], which is written exclusively by the
//! [`HealthTracker`](crate::health::HealthTracker).

use crate::config::{ConfigError, EndpointConfig};
use crate::connection::ConnectionStats;
use crate::health::EndpointHealth;
use http::HeaderValue;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// A single upstream endpoint.
#[derive(Debug)]
pub struct Endpoint {
    index: usize,
    url: String,
    host: HeaderValue,
    weight: u32,
    paths: Vec<String>,
    health: EndpointHealth,
}

impl Endpoint {
    /// Position of this endpoint in the configured list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Base URL without a trailing slash (e.g. `http://10.0.0.1:2242`).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Value for the `Host` header of forwarded requests.
    pub fn host_header(&self) -> &HeaderValue {
        &self.host
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Exact paths this endpoint exclusively serves.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Whether this endpoint serves any path not claimed elsewhere.
    pub fn is_catch_all(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn health(&self) -> &EndpointHealth {
        &self.health
    }

    /// Returns a serializable snapshot of this endpoint.
    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            url: self.url.clone(),
            weight: self.weight,
            paths: self.paths.clone(),
            healthy: self.health.is_healthy(),
            consecutive_failures: self.health.consecutive_failures(),
            connections: None,
        }
    }
}

/// Point-in-time view of an endpoint, served by the admin surface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndpointStatus {
    pub url: String,
    pub weight: u32,
    pub paths: Vec<String>,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Slot usage, when the snapshot was taken through the dispatcher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionStats>,
}

/// Immutable, validated list of endpoints in configuration order.
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Validates the endpoint descriptors and builds the registry.
    ///
    /// Construction is all-or-nothing: the first invalid descriptor aborts
    /// it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The list is empty
    /// - A URL is malformed, not `http://`, or carries a query or fragment
    /// - Two descriptors resolve to the same URL
    /// - A weight is zero
    /// - A claimed path does not start with `/`
    pub fn new(configs: &[EndpointConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut seen = HashSet::new();
        let mut endpoints = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            let endpoint = Self::build_endpoint(index, config)?;
            if !seen.insert(endpoint.url.clone()) {
                return Err(ConfigError::DuplicateEndpoint {
                    url: endpoint.url.clone(),
                });
            }

            info!(
                url = %endpoint.url,
                weight = endpoint.weight,
                paths = ?endpoint.paths,
                "registered endpoint"
            );
            endpoints.push(Arc::new(endpoint));
        }

        Ok(Self { endpoints })
    }

    fn build_endpoint(index: usize, config: &EndpointConfig) -> Result<Endpoint, ConfigError> {
        let raw = config.url().trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if parsed.scheme() != "http" {
            return Err(invalid("only http:// endpoints are supported"));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(invalid("must not contain a query or fragment"));
        }
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let host = HeaderValue::from_str(&authority).map_err(|e| invalid(&e.to_string()))?;

        let url = parsed.as_str().trim_end_matches('/').to_string();

        if config.weight() == 0 {
            return Err(ConfigError::InvalidWeight {
                url,
                weight: config.weight(),
            });
        }

        let mut paths: Vec<String> = Vec::with_capacity(config.paths().len());
        for path in config.paths() {
            if !path.starts_with('/') {
                return Err(invalid(&format!("path '{}' must start with '/'", path)));
            }
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }

        Ok(Endpoint {
            index,
            url,
            host,
            weight: config.weight(),
            paths,
            health: EndpointHealth::new(),
        })
    }

    /// Returns all endpoints in configuration order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Returns the number of endpoints currently marked healthy.
    pub fn healthy_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.health().is_healthy())
            .count()
    }

    /// Returns a snapshot of every endpoint.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(|e| e.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_basic() {
        let registry = EndpointRegistry::new(&[
            EndpointConfig::Url("http://host1:2242/".to_string()),
            EndpointConfig::new("http://host2:2242").with_weight(3),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let first = registry.get(0).unwrap();
        assert_eq!(first.url(), "http://host1:2242");
        assert_eq!(first.host_header(), "host1:2242");
        assert_eq!(first.weight(), 1);
        assert!(first.is_catch_all());
        assert!(first.health().is_healthy());

        let second = registry.get(1).unwrap();
        assert_eq!(second.index(), 1);
        assert_eq!(second.weight(), 3);
    }

    #[test]
    fn test_registry_keeps_base_path() {
        let registry =
            EndpointRegistry::new(&[EndpointConfig::new("http://host:80/api/")]).unwrap();
        let endpoint = registry.get(0).unwrap();
        assert_eq!(endpoint.url(), "http://host/api");
        assert_eq!(endpoint.host_header(), "host");
    }

    #[test]
    fn test_registry_empty() {
        assert!(matches!(
            EndpointRegistry::new(&[]).unwrap_err(),
            ConfigError::NoEndpoints
        ));
    }

    #[test]
    fn test_registry_duplicate_url() {
        let result = EndpointRegistry::new(&[
            EndpointConfig::new("http://host:2242"),
            EndpointConfig::new("http://host:2242/"),
        ]);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::DuplicateEndpoint { .. }
        ));
    }

    #[test]
    fn test_registry_zero_weight() {
        let result = EndpointRegistry::new(&[EndpointConfig::new("http://host:2242").with_weight(0)]);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidWeight { weight: 0, .. }
        ));
    }

    #[test]
    fn test_registry_malformed_url() {
        for url in ["not-a-url", "https://secure:443", "http://host:1?x=1", "ftp://host"] {
            let result = EndpointRegistry::new(&[EndpointConfig::new(url)]);
            assert!(
                matches!(result, Err(ConfigError::InvalidEndpoint { .. })),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_registry_is_all_or_nothing() {
        let result = EndpointRegistry::new(&[
            EndpointConfig::new("http://good:1"),
            EndpointConfig::new("bad"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_relative_path_rejected() {
        let result =
            EndpointRegistry::new(&[EndpointConfig::new("http://host:1").with_path("v1/models")]);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidEndpoint { .. }
        ));
    }

    #[test]
    fn test_registry_dedupes_paths() {
        let registry = EndpointRegistry::new(&[EndpointConfig::new("http://host:1")
            .with_path("/v1/completions")
            .with_path("/v1/completions")])
        .unwrap();
        assert_eq!(registry.get(0).unwrap().paths().len(), 1);
    }

    #[test]
    fn test_status_snapshot() {
        let registry = EndpointRegistry::new(&[EndpointConfig::new("http://host:1")]).unwrap();
        let status = registry.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].healthy);
        assert_eq!(status[0].consecutive_failures, 0);
        assert_eq!(registry.healthy_count(), 1);
    }
}
