use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::runtime_values::RuntimeValue;

/// A user-owned (or pool-owned) group of containers fronted by reverse-proxy
/// routes. This is the unit the lifecycle state machine governs.
///
/// Proxies are value objects: mutation happens by producing a new value and
/// writing it back through the [`ProxyStore`](crate::store::ProxyStore),
/// which enforces compare-and-set semantics via the `version` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    /// Unique identifier (UUID string, caller-supplied for idempotent retries)
    pub id: String,

    /// The proxy that owns the containers this proxy routes to.
    /// Equal to `id` unless a seat of a shared spec was claimed.
    pub target_id: String,

    /// The spec this proxy was started from
    pub spec_id: String,

    /// Owning user. `None` for pool-owned delegate proxies.
    pub user_id: Option<String>,

    /// Human-friendly name, resolved from the spec
    pub display_name: String,

    /// Current lifecycle status
    pub status: ProxyStatus,

    /// When the proxy record was created
    pub created_timestamp: DateTime<Utc>,

    /// When the proxy reached Up. `None` until then.
    pub startup_timestamp: Option<DateTime<Utc>>,

    /// Containers backing this proxy, ordered by spec index.
    /// Empty for delegating proxies (the delegate owns the containers).
    pub containers: Vec<Container>,

    /// Injected key/value pairs, keyed by the stable key id
    pub runtime_values: BTreeMap<String, RuntimeValue>,

    /// Reverse-proxy routes: route-name -> absolute target URI.
    /// Route names are namespaced by proxy id, so they are unique across
    /// all live proxies.
    pub targets: BTreeMap<String, String>,

    /// Store version for compare-and-set updates
    #[serde(default)]
    pub version: u64,
}

/// Initial fields for a new proxy record
#[derive(Debug, Clone)]
pub struct ProxyInit {
    /// Unique identifier (also used as `target_id` until a seat is claimed)
    pub id: String,
    /// The spec the proxy is started from
    pub spec_id: String,
    /// Owning user, absent for delegate proxies
    pub user_id: Option<String>,
    /// Display name (pre-resolution; may be refined after spec resolution)
    pub display_name: String,
}

impl Proxy {
    /// Create a new proxy record in status `New`
    #[must_use]
    pub fn new(init: ProxyInit) -> Self {
        Self {
            target_id: init.id.clone(),
            id: init.id,
            spec_id: init.spec_id,
            user_id: init.user_id,
            display_name: init.display_name,
            status: ProxyStatus::New,
            created_timestamp: Utc::now(),
            startup_timestamp: None,
            containers: Vec::new(),
            runtime_values: BTreeMap::new(),
            targets: BTreeMap::new(),
            version: 0,
        }
    }

    /// Whether this proxy routes to containers owned by another proxy
    #[must_use]
    pub fn is_delegating(&self) -> bool {
        self.target_id != self.id
    }

    /// Insert a runtime value, replacing any previous value for the same key
    pub fn add_runtime_value(&mut self, value: RuntimeValue) {
        self.runtime_values.insert(value.key_id.clone(), value);
    }

    /// Insert a runtime value only when the key is not already present.
    /// Caller-supplied values win over service defaults.
    pub fn add_runtime_value_if_absent(&mut self, value: RuntimeValue) {
        self.runtime_values
            .entry(value.key_id.clone())
            .or_insert(value);
    }

    /// Look up a runtime value by key id
    #[must_use]
    pub fn runtime_value(&self, key_id: &str) -> Option<&RuntimeValue> {
        self.runtime_values.get(key_id)
    }

    /// Environment variables derived from runtime values flagged
    /// `include_as_env`, for the container backend to inject
    #[must_use]
    pub fn env_values(&self) -> BTreeMap<String, String> {
        self.runtime_values
            .values()
            .filter(|v| v.include_as_env)
            .filter_map(|v| {
                v.env_name
                    .as_ref()
                    .map(|name| (name.clone(), v.value_as_string()))
            })
            .collect()
    }

    /// Mark the proxy Up and stamp the startup timestamp
    pub fn mark_up(&mut self) {
        self.status = ProxyStatus::Up;
        self.startup_timestamp = Some(Utc::now());
    }

    /// How long the proxy has been serving. `None` when it never reached Up.
    #[must_use]
    pub fn usage_duration(&self) -> Option<std::time::Duration> {
        let started = self.startup_timestamp?;
        Utc::now().signed_duration_since(started).to_std().ok()
    }

    /// Bind this proxy to another proxy's containers: point `target_id` at
    /// the delegate and take over its routes. Delegate proxies never
    /// register routes themselves, so the names stay unique.
    pub fn bind_to_delegate(&mut self, delegate: &Proxy) {
        self.target_id = delegate.id.clone();
        self.targets = delegate.targets.clone();
    }
}

/// A single container inside a proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Stable ordinal matching the container spec's position
    pub index: usize,

    /// Backend-assigned identifier, absent until the backend returns
    pub id: Option<String>,

    /// Container-scoped runtime values
    pub runtime_values: BTreeMap<String, RuntimeValue>,

    /// Port-name -> absolute URI for this container
    pub targets: BTreeMap<String, String>,
}

impl Container {
    /// Create a container placeholder for the given spec index
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            id: None,
            runtime_values: BTreeMap::new(),
            targets: BTreeMap::new(),
        }
    }
}

/// Proxy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyStatus {
    /// Record reserved, nothing started yet
    New,

    /// Container start in flight
    Starting,

    /// Serving traffic
    Up,

    /// Teardown in flight
    Stopping,

    /// Terminal; the record is removed right after
    Stopped,

    /// Pause in flight
    Pausing,

    /// Containers suspended, routes removed
    Paused,

    /// Resume in flight
    Resuming,
}

impl ProxyStatus {
    /// Statuses in which readiness tests must not run
    #[must_use]
    pub fn unavailable(self) -> bool {
        matches!(
            self,
            Self::Stopping | Self::Stopped | Self::Pausing | Self::Paused
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Starting)
                | (Self::New, Self::Up)
                | (Self::New, Self::Stopping)
                | (Self::Starting, Self::Up)
                | (Self::Starting, Self::Stopping)
                | (Self::Up, Self::Stopping)
                | (Self::Up, Self::Pausing)
                | (Self::Stopping, Self::Stopped)
                | (Self::Pausing, Self::Paused)
                | (Self::Pausing, Self::Up)
                | (Self::Paused, Self::Resuming)
                | (Self::Paused, Self::Stopping)
                | (Self::Resuming, Self::Up)
                | (Self::Resuming, Self::Stopping)
        )
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Starting => "Starting",
            Self::Up => "Up",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Pausing => "Pausing",
            Self::Paused => "Paused",
            Self::Resuming => "Resuming",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_values::RuntimeValue;

    fn proxy(id: &str) -> Proxy {
        Proxy::new(ProxyInit {
            id: id.to_owned(),
            spec_id: "spec-1".to_owned(),
            user_id: Some("alice".to_owned()),
            display_name: "Spec One".to_owned(),
        })
    }

    #[test]
    fn test_new_proxy_defaults() {
        let p = proxy("p-1");
        assert_eq!(p.status, ProxyStatus::New);
        assert_eq!(p.target_id, "p-1");
        assert!(!p.is_delegating());
        assert!(p.startup_timestamp.is_none());
        assert!(p.usage_duration().is_none());
    }

    #[test]
    fn test_unavailable_statuses() {
        assert!(ProxyStatus::Stopping.unavailable());
        assert!(ProxyStatus::Stopped.unavailable());
        assert!(ProxyStatus::Pausing.unavailable());
        assert!(ProxyStatus::Paused.unavailable());
        assert!(!ProxyStatus::Up.unavailable());
        assert!(!ProxyStatus::Starting.unavailable());
    }

    #[test]
    fn test_transitions() {
        use ProxyStatus::*;
        assert!(New.can_transition(Starting));
        assert!(Starting.can_transition(Up));
        assert!(Up.can_transition(Pausing));
        assert!(Paused.can_transition(Resuming));
        assert!(Resuming.can_transition(Up));
        assert!(Stopping.can_transition(Stopped));
        // A failed pause goes back into service
        assert!(Pausing.can_transition(Up));

        // Illegal moves
        assert!(!Stopping.can_transition(Pausing));
        assert!(!Stopped.can_transition(Starting));
        assert!(!Paused.can_transition(Up));
        assert!(!Up.can_transition(Resuming));
    }

    #[test]
    fn test_caller_values_win_over_defaults() {
        let mut p = proxy("p-2");
        p.add_runtime_value(RuntimeValue::custom("answer", None, "caller", false));
        p.add_runtime_value_if_absent(RuntimeValue::custom("answer", None, "default", false));
        assert_eq!(
            p.runtime_value("answer").unwrap().value_as_string(),
            "caller"
        );
    }

    #[test]
    fn test_env_values_filters_and_names() {
        let mut p = proxy("p-3");
        p.add_runtime_value(RuntimeValue::custom(
            "visible",
            Some("VISIBLE".to_owned()),
            "yes",
            true,
        ));
        p.add_runtime_value(RuntimeValue::custom("hidden", None, "no", false));
        let env = p.env_values();
        assert_eq!(env.get("VISIBLE").map(String::as_str), Some("yes"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_bind_to_delegate_takes_over_routes() {
        let mut delegate = proxy("d-1");
        delegate
            .targets
            .insert("d-1/default".to_owned(), "http://10.0.0.5:8080".to_owned());

        let mut user = proxy("u-1");
        user.bind_to_delegate(&delegate);

        assert_eq!(user.target_id, "d-1");
        assert!(user.is_delegating());
        assert_eq!(
            user.targets.get("d-1/default").map(String::as_str),
            Some("http://10.0.0.5:8080")
        );
    }
}
