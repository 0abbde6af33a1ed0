//! Route registry consumed by the HTTP proxying layer.
//!
//! Routes are keyed by target-name, not proxy id; a target-name must never
//! be live for two proxies at once. The request-proxying machinery itself
//! lives outside this crate; the core only maintains the registry.

use dashmap::DashMap;

use crate::core::errors::ProxyError;
use crate::core::proxy::Proxy;

/// Registry of live reverse-proxy routes: route-name -> target URI.
#[derive(Debug, Default)]
pub struct MappingManager {
    mappings: DashMap<String, String>,
}

impl MappingManager {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all routes of a proxy.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::RouteConflict`] when any route name is already
    /// live; partially inserted routes are rolled back. Route names are
    /// namespaced by proxy id, so a conflict is programmer error.
    pub fn register_proxy(&self, proxy: &Proxy) -> Result<(), ProxyError> {
        let mut inserted: Vec<&str> = Vec::with_capacity(proxy.targets.len());
        for (route, target) in &proxy.targets {
            match self.mappings.entry(route.clone()) {
                dashmap::Entry::Vacant(entry) => {
                    entry.insert(target.clone());
                    inserted.push(route);
                }
                dashmap::Entry::Occupied(_) => {
                    for route in inserted {
                        self.mappings.remove(route);
                    }
                    return Err(ProxyError::RouteConflict {
                        route: route.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove all routes of a proxy
    pub fn unregister_proxy(&self, proxy: &Proxy) {
        for route in proxy.targets.keys() {
            self.mappings.remove(route);
        }
    }

    /// Target URI for a route, if live
    #[must_use]
    pub fn target_for(&self, route: &str) -> Option<String> {
        self.mappings.get(route).map(|entry| entry.value().clone())
    }

    /// Whether a route is live
    #[must_use]
    pub fn contains(&self, route: &str) -> bool {
        self.mappings.contains_key(route)
    }

    /// All live route names
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.mappings.iter().map(|e| e.key().clone()).collect()
    }
}
