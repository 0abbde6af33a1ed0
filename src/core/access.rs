//! Access-control gate on (user, spec) pairs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::spec::{ProxySpec, SpecRegistry};

/// The authenticated caller as the core sees it. Produced by the HTTP
/// layer's authentication backend, consumed here as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Stable user identifier
    pub user_id: String,

    /// Groups the user belongs to
    pub groups: Vec<String>,

    /// Whether the auth backend produced a guest principal
    pub anonymous: bool,

    /// Whether the user holds the admin role
    pub admin: bool,
}

impl AuthContext {
    /// A regular authenticated user
    #[must_use]
    pub fn user(user_id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups,
            anonymous: false,
            admin: false,
        }
    }

    /// An administrator
    #[must_use]
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: Vec::new(),
            anonymous: false,
            admin: true,
        }
    }

    /// A guest principal from a non-authorizing backend
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_owned(),
            groups: Vec::new(),
            anonymous: true,
            admin: false,
        }
    }

    /// Case-insensitive group membership test
    #[must_use]
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }
}

/// Pure predicate deciding whether a user may start proxies from a spec.
///
/// Rules are evaluated in order, first positive wins; the predicate has no
/// side effects and is deterministic for a given (auth, spec) pair.
#[derive(Debug, Clone)]
pub struct AccessControl {
    registry: Arc<SpecRegistry>,
    authorization_enabled: bool,
}

impl AccessControl {
    /// Create the gate. `authorization_enabled` reflects whether the auth
    /// backend enforces authorization at all.
    #[must_use]
    pub fn new(registry: Arc<SpecRegistry>, authorization_enabled: bool) -> Self {
        Self {
            registry,
            authorization_enabled,
        }
    }

    /// Whether `auth` may start proxies from `spec`
    #[must_use]
    pub fn can_access(&self, auth: Option<&AuthContext>, spec: Option<&ProxySpec>) -> bool {
        let (Some(auth), Some(spec)) = (auth, spec) else {
            return false;
        };

        let unrestricted = spec
            .access_control
            .as_ref()
            .is_none_or(super::spec::AccessControlSpec::is_empty);

        if !self.authorization_enabled {
            return auth.anonymous || unrestricted;
        }

        let Some(ac) = spec.access_control.as_ref() else {
            return true;
        };
        if ac.is_empty() {
            return true;
        }

        if ac.users.iter().any(|u| u == &auth.user_id) {
            return true;
        }

        if ac.groups.iter().any(|g| auth.is_member_of(g)) {
            return true;
        }

        false
    }

    /// Convenience overload resolving the spec by id; unknown ids deny.
    #[must_use]
    pub fn can_access_spec_id(&self, auth: Option<&AuthContext>, spec_id: &str) -> bool {
        match self.registry.get(spec_id) {
            Some(spec) => self.can_access(auth, Some(&spec)),
            None => false,
        }
    }
}
