//! Configuration for the load balancer.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
///
/// Any of these prevents the load balancer from starting.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file '{path}': {reason}")]
    Parse { path: String, reason: String },

    /// No endpoints configured.
    #[error("at least one endpoint is required")]
    NoEndpoints,

    /// Invalid endpoint URL.
    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    /// The same endpoint URL appears more than once.
    #[error("duplicate endpoint url: {url}")]
    DuplicateEndpoint { url: String },

    /// Endpoint weight must be at least one.
    #[error("endpoint '{url}' has invalid weight {weight}, must be >= 1")]
    InvalidWeight { url: String, weight: u32 },

    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Invalid admin address format.
    #[error("invalid admin address '{addr}': {reason}")]
    InvalidAdminAddr { addr: String, reason: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Failure threshold must be at least one.
    #[error("failure_threshold must be >= 1")]
    InvalidFailureThreshold,

    /// Connection limit must be at least one.
    #[error("max_connections_per_endpoint must be >= 1")]
    InvalidConnectionLimit,
}

/// A single configured backend.
///
/// Accepts either a bare URL string or a descriptor with weight and path
/// affinity:
///
/// ```yaml
/// endpoints:
///   - http://127.0.0.1:2242
///   - url: http://127.0.0.1:2243
///     weight: 2
///     paths: ["/v1/completions"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointConfig {
    /// Bare URL with weight 1 and no path affinity.
    Url(String),
    /// Full descriptor.
    Detailed {
        url: String,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(default)]
        paths: Vec<String>,
    },
}

fn default_weight() -> u32 {
    1
}

impl EndpointConfig {
    /// Creates a catch-all endpoint with weight 1.
    pub fn new(url: impl Into<String>) -> Self {
        Self::Detailed {
            url: url.into(),
            weight: default_weight(),
            paths: Vec::new(),
        }
    }

    /// Sets the weight.
    pub fn with_weight(self, weight: u32) -> Self {
        Self::Detailed {
            url: self.url().to_string(),
            weight,
            paths: self.paths().to_vec(),
        }
    }

    /// Adds an exact path this endpoint exclusively serves.
    pub fn with_path(self, path: impl Into<String>) -> Self {
        let mut paths = self.paths().to_vec();
        paths.push(path.into());
        Self::Detailed {
            url: self.url().to_string(),
            weight: self.weight(),
            paths,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            EndpointConfig::Url(url) => url,
            EndpointConfig::Detailed { url, .. } => url,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            EndpointConfig::Url(_) => default_weight(),
            EndpointConfig::Detailed { weight, .. } => *weight,
        }
    }

    pub fn paths(&self) -> &[String] {
        match self {
            EndpointConfig::Url(_) => &[],
            EndpointConfig::Detailed { paths, .. } => paths,
        }
    }
}

/// Active health check settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Path probed on unhealthy endpoints.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Interval between probe rounds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for a single probe.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval_ms() -> u64 {
    10_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Load balancer configuration loaded at startup.
///
/// Immutable after initialization. Every field except `endpoints` has a
/// default, so the smallest useful file is a list of endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Interface to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Optional address for the admin surface (`/health`, `/metrics`, `/endpoints`).
    pub admin_addr: Option<String>,
    /// Ordered list of backends.
    pub endpoints: Vec<EndpointConfig>,
    /// Timeout for establishing a backend connection.
    pub connect_timeout_ms: u64,
    /// Total time allowed for one attempt, response body included.
    pub request_timeout_ms: u64,
    /// Consecutive failures before an endpoint is marked unhealthy.
    pub failure_threshold: u32,
    /// Time an unhealthy endpoint waits before a half-open attempt.
    pub cooldown_ms: u64,
    /// Whether a 5xx response triggers failover to another endpoint.
    pub failover_on_5xx: bool,
    /// Upper bound on attempts per request; defaults to the route group size.
    pub max_attempts: Option<u32>,
    /// Maximum concurrent exchanges per endpoint.
    pub max_connections_per_endpoint: usize,
    /// Maximum idle pooled connections kept per endpoint.
    pub pool_max_idle_per_endpoint: usize,
    /// Idle pooled connection lifetime.
    pub pool_idle_timeout_ms: u64,
    /// Request body bytes retained so the request can be retried.
    pub max_replay_bytes: usize,
    /// Time allowed for in-flight exchanges to finish at shutdown.
    pub drain_timeout_ms: u64,
    /// Answer preflight requests and add permissive CORS headers.
    pub cors: bool,
    /// Optional active health checking of unhealthy endpoints.
    pub health_check: Option<HealthCheckConfig>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_addr: None,
            endpoints: Vec::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            failure_threshold: 3,
            cooldown_ms: 10_000,
            failover_on_5xx: true,
            max_attempts: None,
            max_connections_per_endpoint: 100,
            pool_max_idle_per_endpoint: 32,
            pool_idle_timeout_ms: 90_000,
            max_replay_bytes: 4 * 1024 * 1024,
            drain_timeout_ms: 30_000,
            cors: true,
            health_check: None,
        }
    }
}

impl LoadBalancerConfig {
    /// Loads configuration from a file, choosing the format by extension.
    ///
    /// `.toml` and `.json` files are parsed as such; anything else is YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content).map_err(|e| e.to_string()),
            Some("json") => Self::from_json(&content).map_err(|e| e.to_string()),
            _ => Self::from_yaml(&content).map_err(|e| e.to_string()),
        };

        parsed.map_err(|reason| ConfigError::Parse {
            path: display,
            reason,
        })
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Returns the `host:port` string the proxy listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the non-endpoint settings.
    ///
    /// Endpoint descriptors are validated when the
    /// [`EndpointRegistry`](crate::endpoint::EndpointRegistry) is built.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The listen or admin address does not resolve to a socket address
    /// - No endpoints are configured
    /// - A timeout or health check interval is zero or exceeds one hour
    /// - The failure threshold or connection limit is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listen_addr = self.listen_addr();
        resolve(&listen_addr).map_err(|reason| ConfigError::InvalidListenAddr {
            addr: listen_addr.clone(),
            reason,
        })?;

        if let Some(admin_addr) = &self.admin_addr {
            resolve(admin_addr).map_err(|reason| ConfigError::InvalidAdminAddr {
                addr: admin_addr.clone(),
                reason,
            })?;

            if *admin_addr == listen_addr {
                return Err(ConfigError::InvalidAdminAddr {
                    addr: admin_addr.clone(),
                    reason: "must differ from the proxy listen address".to_string(),
                });
            }
        }

        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut timeouts = vec![
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("cooldown_ms", self.cooldown_ms),
        ];
        if let Some(health_check) = &self.health_check {
            timeouts.push(("health_check.interval_ms", health_check.interval_ms));
            timeouts.push(("health_check.timeout_ms", health_check.timeout_ms));
        }

        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout {
                    reason: format!("{} must be greater than zero", name),
                });
            }
            if Duration::from_millis(value) > Duration::from_secs(3600) {
                return Err(ConfigError::InvalidTimeout {
                    reason: format!("{} must not exceed 1 hour", name),
                });
            }
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }

        if self.max_connections_per_endpoint == 0 {
            return Err(ConfigError::InvalidConnectionLimit);
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Resolves `host:port` the way the listeners will bind it. Hostnames such
/// as `localhost` are accepted.
fn resolve(addr: &str) -> Result<(), String> {
    let mut addrs = addr.to_socket_addrs().map_err(|e| e.to_string())?;
    match addrs.next() {
        Some(_) => Ok(()),
        None => Err("resolved to no addresses".to_string()),
    }
}
