//! Aphrodite load balancer
//!
//! An HTTP reverse proxy that spreads requests over a set of inference
//! backends with smooth weighted round-robin, exact-path routing, passive
//! health tracking with half-open recovery, and transparent failover while
//! streaming request and response bodies.

pub mod admin;
pub mod admin_listener;
pub mod body;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod service;

pub use config::{ConfigError, EndpointConfig, LoadBalancerConfig};
pub use dispatch::{DispatchEvent, Dispatcher, Outcome};
pub use error::{BackendError, DispatchError, ProxyError};
