//! Keyed values injected into a proxy before and after spec resolution.
//!
//! The two-phase split is a contract, not an implementation detail: the
//! pre-resolution phase populates values that spec expressions reference,
//! the post-resolution phase populates values computed from expression
//! results. Collapsing the phases breaks specs whose expressions mention
//! the proxy under construction.

use serde::{Deserialize, Serialize};

use super::access::AuthContext;
use super::proxy::Proxy;
use super::spec::ProxySpec;
use crate::config;

/// Identity and metadata of a runtime value: a stable key id, the
/// environment variable it surfaces as (if any), and whether it is
/// injected into container environments by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeValueKey {
    /// Stable identifier, also the map key on the proxy
    pub id: &'static str,
    /// Environment variable name for containers
    pub env_name: &'static str,
    /// Whether the value is exported to container environments
    pub include_as_env: bool,
}

/// The proxy's own id
pub const PROXY_ID_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "proxy_id",
    env_name: "PORTICO_PROXY_ID",
    include_as_env: true,
};

/// The id of the proxy owning the containers (differs under seat claims)
pub const TARGET_ID_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "target_id",
    env_name: "PORTICO_TARGET_ID",
    include_as_env: false,
};

/// The spec the proxy was started from
pub const SPEC_ID_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "spec_id",
    env_name: "PORTICO_SPEC_ID",
    include_as_env: true,
};

/// The owning user
pub const USER_ID_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "user_id",
    env_name: "PORTICO_USER_ID",
    include_as_env: true,
};

/// Comma-joined groups of the owning user
pub const USER_GROUPS_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "user_groups",
    env_name: "PORTICO_USER_GROUPS",
    include_as_env: true,
};

/// RFC 3339 creation timestamp of the proxy record
pub const CREATED_TIMESTAMP_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "created_timestamp",
    env_name: "PORTICO_CREATED_TIMESTAMP",
    include_as_env: false,
};

/// The public path under which the proxy's routes are exposed
pub const PUBLIC_PATH_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "public_path",
    env_name: "PORTICO_PUBLIC_PATH",
    include_as_env: true,
};

/// Display name after spec resolution
pub const DISPLAY_NAME_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "display_name",
    env_name: "PORTICO_DISPLAY_NAME",
    include_as_env: false,
};

/// The seat claimed by a delegating proxy
pub const SEAT_ID_KEY: RuntimeValueKey = RuntimeValueKey {
    id: "seat_id",
    env_name: "PORTICO_SEAT_ID",
    include_as_env: false,
};

/// A single injected value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeValue {
    /// Stable key id
    pub key_id: String,

    /// Environment variable name, when the value can surface as env
    pub env_name: Option<String>,

    /// The value itself; kept as JSON so typed values round-trip
    pub value: serde_json::Value,

    /// Whether the value is injected into container environments
    pub include_as_env: bool,
}

impl RuntimeValue {
    /// Create a value under a well-known key
    #[must_use]
    pub fn new(key: RuntimeValueKey, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key_id: key.id.to_owned(),
            env_name: Some(key.env_name.to_owned()),
            value: value.into(),
            include_as_env: key.include_as_env,
        }
    }

    /// Create a value under a dynamic key (e.g. a spec parameter)
    #[must_use]
    pub fn custom(
        key_id: impl Into<String>,
        env_name: Option<String>,
        value: impl Into<serde_json::Value>,
        include_as_env: bool,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            env_name,
            value: value.into(),
            include_as_env,
        }
    }

    /// The value rendered as a plain string (env form)
    #[must_use]
    pub fn value_as_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Populates runtime values around spec resolution.
#[derive(Debug, Clone, Default)]
pub struct RuntimeValueService;

impl RuntimeValueService {
    /// Create the service
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Phase one: values spec expressions may reference. Caller-supplied
    /// values for the same keys are preserved.
    pub fn add_runtime_values_before_resolution(
        &self,
        proxy: &mut Proxy,
        spec: &ProxySpec,
        auth: Option<&AuthContext>,
    ) {
        proxy.add_runtime_value_if_absent(RuntimeValue::new(PROXY_ID_KEY, proxy.id.clone()));
        proxy.add_runtime_value_if_absent(RuntimeValue::new(TARGET_ID_KEY, proxy.target_id.clone()));
        proxy.add_runtime_value_if_absent(RuntimeValue::new(SPEC_ID_KEY, spec.id.clone()));
        proxy.add_runtime_value_if_absent(RuntimeValue::new(
            CREATED_TIMESTAMP_KEY,
            proxy.created_timestamp.to_rfc3339(),
        ));
        proxy.add_runtime_value_if_absent(RuntimeValue::new(
            PUBLIC_PATH_KEY,
            format!("{}{}", config::public_path_prefix(), proxy.target_id),
        ));

        if let Some(auth) = auth {
            proxy.add_runtime_value_if_absent(RuntimeValue::new(USER_ID_KEY, auth.user_id.clone()));
            proxy.add_runtime_value_if_absent(RuntimeValue::new(
                USER_GROUPS_KEY,
                auth.groups.join(","),
            ));
        }
    }

    /// Phase two: values computed from expression results.
    pub fn add_runtime_values_after_resolution(&self, proxy: &mut Proxy, resolved: &ProxySpec) {
        let display_name = resolved
            .display_name
            .clone()
            .unwrap_or_else(|| resolved.id.clone());
        proxy.display_name = display_name.clone();
        proxy.add_runtime_value(RuntimeValue::new(DISPLAY_NAME_KEY, display_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::ProxyInit;
    use crate::core::spec::ProxySpec;

    fn spec() -> ProxySpec {
        ProxySpec {
            id: "s1".to_owned(),
            display_name: Some("Shiny App".to_owned()),
            ..ProxySpec::default()
        }
    }

    fn proxy() -> Proxy {
        Proxy::new(ProxyInit {
            id: "p-1".to_owned(),
            spec_id: "s1".to_owned(),
            user_id: Some("alice".to_owned()),
            display_name: "s1".to_owned(),
        })
    }

    #[test]
    fn test_before_resolution_populates_identity_keys() {
        let svc = RuntimeValueService::new();
        let mut p = proxy();
        let auth = AuthContext::user("alice", vec!["science".to_owned()]);

        svc.add_runtime_values_before_resolution(&mut p, &spec(), Some(&auth));

        assert_eq!(
            p.runtime_value(PROXY_ID_KEY.id).unwrap().value_as_string(),
            "p-1"
        );
        assert_eq!(
            p.runtime_value(USER_GROUPS_KEY.id).unwrap().value_as_string(),
            "science"
        );
        let public_path = p.runtime_value(PUBLIC_PATH_KEY.id).unwrap().value_as_string();
        assert!(public_path.ends_with("p-1"));
    }

    #[test]
    fn test_after_resolution_sets_display_name() {
        let svc = RuntimeValueService::new();
        let mut p = proxy();

        svc.add_runtime_values_after_resolution(&mut p, &spec());

        assert_eq!(p.display_name, "Shiny App");
        assert_eq!(
            p.runtime_value(DISPLAY_NAME_KEY.id).unwrap().value_as_string(),
            "Shiny App"
        );
    }

    #[test]
    fn test_anonymous_start_has_no_user_keys() {
        let svc = RuntimeValueService::new();
        let mut p = proxy();

        svc.add_runtime_values_before_resolution(&mut p, &spec(), None);

        assert!(p.runtime_value(USER_ID_KEY.id).is_none());
    }
}
