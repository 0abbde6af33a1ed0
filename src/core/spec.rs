use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::ProxyError;
use super::resolver::{ResolutionContext, SpecResolver};

/// Declarative template for a proxy. Immutable once registered; resolution
/// produces a fresh instance with expressions substituted.
///
/// String-typed fields may contain `{{ ... }}` expressions evaluated against
/// a context holding the proxy under construction, the spec, and the
/// authenticated user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySpec {
    /// Unique spec identifier
    pub id: String,

    /// Optional display name (expression-bearing)
    pub display_name: Option<String>,

    /// Ordered container templates
    pub container_specs: Vec<ContainerSpec>,

    /// Who may start proxies from this spec; absent means unrestricted
    pub access_control: Option<AccessControlSpec>,

    /// User-overridable parameters with allowed-value sets
    pub parameters: Vec<ParameterSpec>,

    /// Pre-warmed seat pool configuration; presence enables sharing
    pub sharing: Option<ProxySharingSpec>,
}

impl ProxySpec {
    /// Phase one of resolution: everything except container environments.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SpecResolutionFailed`] when a template fails to
    /// render.
    pub fn first_resolve(
        &self,
        resolver: &SpecResolver,
        ctx: &ResolutionContext,
    ) -> Result<Self, ProxyError> {
        let mut resolved = self.clone();
        if let Some(name) = &self.display_name {
            resolved.display_name = Some(resolver.resolve_str(&self.id, name, ctx)?);
        }
        for container in &mut resolved.container_specs {
            container.image = resolver.resolve_str(&self.id, &container.image, ctx)?;
            for arg in &mut container.cmd {
                *arg = resolver.resolve_str(&self.id, arg, ctx)?;
            }
        }
        Ok(resolved)
    }

    /// Phase two of resolution: container environments, which may reference
    /// values computed from phase-one results.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SpecResolutionFailed`] when a template fails to
    /// render.
    pub fn final_resolve(
        &self,
        resolver: &SpecResolver,
        ctx: &ResolutionContext,
    ) -> Result<Self, ProxyError> {
        let mut resolved = self.clone();
        for container in &mut resolved.container_specs {
            for value in container.env.values_mut() {
                *value = resolver.resolve_str(&self.id, value, ctx)?;
            }
        }
        Ok(resolved)
    }

    /// Convenience single-shot resolution: both phases against one context.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SpecResolutionFailed`] when a template fails to
    /// render.
    pub fn resolve(
        &self,
        resolver: &SpecResolver,
        ctx: &ResolutionContext,
    ) -> Result<Self, ProxyError> {
        self.first_resolve(resolver, ctx)?.final_resolve(resolver, ctx)
    }
}

/// Template for a single container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Image reference (expression-bearing)
    pub image: String,

    /// Command override (expression-bearing elements)
    pub cmd: Vec<String>,

    /// Environment variables (expression-bearing values)
    pub env: BTreeMap<String, String>,

    /// Named ports exposed as routes
    pub port_mappings: Vec<PortMapping>,

    /// Memory limit, e.g. "2g"
    pub memory_limit: Option<String>,

    /// CPU limit, e.g. "2"
    pub cpu_limit: Option<String>,
}

/// A named container port that becomes a reverse-proxy route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Route leaf name, e.g. "default"
    pub name: String,
    /// Container port
    pub port: u16,
}

/// Who may start proxies from a spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControlSpec {
    /// Users allowed by name
    pub users: Vec<String>,

    /// Groups allowed by membership
    pub groups: Vec<String>,
}

impl AccessControlSpec {
    /// True when the block grants nothing (treated as unrestricted)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }
}

/// A user-overridable parameter with an allowed-value set.
/// The first allowed value is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter identifier, also the runtime-value key suffix
    pub id: String,

    /// Optional display name for UIs
    #[serde(default)]
    pub display_name: Option<String>,

    /// Allowed values, first is the default
    pub values: Vec<String>,
}

/// Pool configuration for specs whose proxies are pre-started and claimed
/// as interchangeable seats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySharingSpec {
    /// Desired steady-state number of unclaimed seats
    pub minimum_seats_available: u32,

    /// Upper bound on unclaimed seats before scale-down kicks in
    pub maximum_seats_available: u32,
}

/// In-memory spec registry. Specs are immutable once registered.
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: DashMap<String, Arc<ProxySpec>>,
}

impl SpecRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::IllegalState`] when the id is already taken.
    pub fn register(&self, spec: ProxySpec) -> Result<Arc<ProxySpec>, ProxyError> {
        let id = spec.id.clone();
        let spec = Arc::new(spec);
        match self.specs.entry(id.clone()) {
            dashmap::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&spec));
                Ok(spec)
            }
            dashmap::Entry::Occupied(_) => Err(ProxyError::IllegalState {
                subject: id,
                operation: "register spec".to_owned(),
                state: "already registered".to_owned(),
            }),
        }
    }

    /// Look up a spec by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ProxySpec>> {
        self.specs.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// All registered spec ids
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.specs.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_control_empty() {
        assert!(AccessControlSpec::default().is_empty());
        let ac = AccessControlSpec {
            users: vec!["alice".to_owned()],
            groups: vec![],
        };
        assert!(!ac.is_empty());
    }

    #[test]
    fn test_registry_rejects_duplicate_id() {
        let registry = SpecRegistry::new();
        registry
            .register(ProxySpec {
                id: "s1".to_owned(),
                ..ProxySpec::default()
            })
            .unwrap();

        let err = registry
            .register(ProxySpec {
                id: "s1".to_owned(),
                ..ProxySpec::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProxyError::IllegalState { .. }));
        assert!(registry.get("s1").is_some());
    }

    #[test]
    fn test_registry_unknown_id() {
        let registry = SpecRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
