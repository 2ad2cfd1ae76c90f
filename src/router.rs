//! Exact-path routing of requests to endpoint groups.
//!
//! Endpoints that claim paths serve those paths exclusively; every other
//! path goes to the catch-all endpoints (those claiming nothing). The two
//! are never mixed: a claimed path is only ever served by its claimants.

use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::DispatchError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a route group.
///
/// Two paths whose eligible endpoint sets are equal resolve to the same
/// group, and therefore share scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

/// Ordered, deduplicated set of endpoints eligible for a request path.
#[derive(Debug)]
pub struct RouteGroup {
    id: GroupId,
    endpoints: Vec<Arc<Endpoint>>,
    total_weight: u64,
}

impl RouteGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Members in configuration order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Sum of member weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Returns the member URLs, mostly for diagnostics.
    pub fn urls(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.url()).collect()
    }
}

/// Builds route groups at startup and resolves request paths to them.
#[derive(Debug)]
pub struct PathRouter {
    exact: HashMap<String, Arc<RouteGroup>>,
    catch_all: Option<Arc<RouteGroup>>,
    groups: Vec<Arc<RouteGroup>>,
}

impl PathRouter {
    /// Creates a router from the registry's path claims.
    pub fn new(registry: &EndpointRegistry) -> Self {
        let mut claims: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut catch_all = Vec::new();

        for endpoint in registry.iter() {
            if endpoint.is_catch_all() {
                catch_all.push(endpoint.index());
                continue;
            }
            for path in endpoint.paths() {
                claims.entry(path.as_str()).or_default().push(endpoint.index());
            }
        }

        let mut interned: HashMap<Vec<usize>, Arc<RouteGroup>> = HashMap::new();
        let mut groups = Vec::new();
        let mut intern = |members: Vec<usize>| -> Arc<RouteGroup> {
            interned
                .entry(members.clone())
                .or_insert_with(|| {
                    let endpoints: Vec<_> = members
                        .iter()
                        .filter_map(|&i| registry.get(i).cloned())
                        .collect();
                    let group = Arc::new(RouteGroup {
                        id: GroupId(groups.len()),
                        total_weight: endpoints.iter().map(|e| u64::from(e.weight())).sum(),
                        endpoints,
                    });
                    groups.push(group.clone());
                    group
                })
                .clone()
        };

        let exact: HashMap<String, Arc<RouteGroup>> = claims
            .into_iter()
            .map(|(path, members)| (path.to_string(), intern(members)))
            .collect();

        let catch_all = if catch_all.is_empty() {
            None
        } else {
            Some(intern(catch_all))
        };

        for (path, group) in &exact {
            info!(path = %path, endpoints = ?group.urls(), "exact route");
        }
        if let Some(group) = &catch_all {
            info!(endpoints = ?group.urls(), "catch-all route");
        }

        Self {
            exact,
            catch_all,
            groups,
        }
    }

    /// Resolves a request path to its route group.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoRoute`] if the path is unclaimed and no
    /// catch-all endpoint exists.
    pub fn route(&self, path: &str) -> Result<Arc<RouteGroup>, DispatchError> {
        if let Some(group) = self.exact.get(path) {
            debug!(path = %path, group = ?group.id(), "matched exact route");
            return Ok(group.clone());
        }

        match &self.catch_all {
            Some(group) => {
                debug!(path = %path, group = ?group.id(), "using catch-all route");
                Ok(group.clone())
            }
            None => {
                debug!(path = %path, "no matching route found");
                Err(DispatchError::NoRoute {
                    path: path.to_string(),
                })
            }
        }
    }

    /// Returns every distinct route group.
    pub fn groups(&self) -> &[Arc<RouteGroup>] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    fn router(configs: &[EndpointConfig]) -> PathRouter {
        PathRouter::new(&EndpointRegistry::new(configs).unwrap())
    }

    #[test]
    fn test_claimed_path_goes_to_claimant_only() {
        let router = router(&[
            EndpointConfig::new("http://e1:1").with_path("/v1/completions"),
            EndpointConfig::new("http://e2:1"),
        ]);

        let group = router.route("/v1/completions").unwrap();
        assert_eq!(group.urls(), vec!["http://e1:1"]);

        let group = router.route("/v1/chat/completions").unwrap();
        assert_eq!(group.urls(), vec!["http://e2:1"]);
    }

    #[test]
    fn test_exact_match_only() {
        let router = router(&[
            EndpointConfig::new("http://e1:1").with_path("/v1/completions"),
            EndpointConfig::new("http://e2:1"),
        ]);

        for path in ["/v1/completions/", "/v1/completions/x", "/v1"] {
            assert_eq!(router.route(path).unwrap().urls(), vec!["http://e2:1"]);
        }
    }

    #[test]
    fn test_no_route_without_catch_all() {
        let router = router(&[EndpointConfig::new("http://e1:1").with_path("/v1/completions")]);
        let result = router.route("/v1/models");
        assert!(matches!(
            result.unwrap_err(),
            DispatchError::NoRoute { path } if path == "/v1/models"
        ));
    }

    #[test]
    fn test_shared_claim_preserves_config_order() {
        let router = router(&[
            EndpointConfig::new("http://a:1").with_path("/v1/completions"),
            EndpointConfig::new("http://b:1"),
            EndpointConfig::new("http://c:1").with_path("/v1/completions"),
        ]);

        let group = router.route("/v1/completions").unwrap();
        assert_eq!(group.urls(), vec!["http://a:1", "http://c:1"]);
    }

    #[test]
    fn test_same_member_set_shares_group() {
        let router = router(&[
            EndpointConfig::new("http://a:1")
                .with_path("/v1/completions")
                .with_path("/v1/chat/completions"),
            EndpointConfig::new("http://b:1"),
        ]);

        let completions = router.route("/v1/completions").unwrap();
        let chat = router.route("/v1/chat/completions").unwrap();
        assert_eq!(completions.id(), chat.id());

        let other = router.route("/v1/models").unwrap();
        assert_ne!(completions.id(), other.id());
        assert_eq!(router.groups().len(), 2);
    }

    #[test]
    fn test_group_total_weight() {
        let router = router(&[
            EndpointConfig::new("http://a:1").with_weight(2),
            EndpointConfig::new("http://b:1").with_weight(3),
        ]);
        let group = router.route("/anything").unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.total_weight(), 5);
    }
}
