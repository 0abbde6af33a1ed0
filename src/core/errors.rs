//! Error taxonomy for proxy lifecycle operations.

use thiserror::Error;

/// Errors surfaced by the lifecycle engine and the pool scaler.
///
/// The pre-command phase surfaces these synchronously and leaves no store
/// residue; the command phase rolls back (stop container, remove record,
/// publish a start-failed event) before returning one.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The caller may not perform the operation.
    #[error("user {user} may not access spec {spec_id}")]
    AccessDenied {
        /// The denied user (or "anonymous").
        user: String,
        /// The spec the user was denied on.
        spec_id: String,
    },

    /// User-supplied parameters failed validation against the spec schema.
    #[error("invalid parameters for spec {spec_id}: {reason}")]
    InvalidParameters {
        /// The spec whose schema rejected the parameters.
        spec_id: String,
        /// Why validation failed.
        reason: String,
    },

    /// The container backend cannot perform the operation.
    #[error("operation '{operation}' is not supported by the container backend")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// The backend failed to start the container group (or no seat could be
    /// claimed for a shared spec in time).
    #[error("proxy {proxy_id} failed to start")]
    ContainerStartFailed {
        /// The proxy that failed.
        proxy_id: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// The container group started but never passed the readiness probe.
    #[error("proxy {proxy_id} started but is not responding")]
    NotResponding {
        /// The proxy that failed its probe.
        proxy_id: String,
    },

    /// The requested transition is not allowed from the current status.
    #[error("cannot {operation} {subject}: currently {state}")]
    IllegalState {
        /// The proxy or spec id.
        subject: String,
        /// The attempted operation.
        operation: String,
        /// The state that forbids it.
        state: String,
    },

    /// Proxy or spec id unknown.
    #[error("{kind} {id} not found")]
    NotFound {
        /// What kind of thing was looked up ("proxy" or "spec").
        kind: &'static str,
        /// The unknown id.
        id: String,
    },

    /// A route name was already registered for another live proxy.
    /// Route names are namespaced by proxy id, so this is programmer error.
    #[error("route '{route}' is already registered")]
    RouteConflict {
        /// The conflicting route name.
        route: String,
    },

    /// A spec expression failed to render.
    #[error("expression resolution failed for spec {spec_id}: {reason}")]
    SpecResolutionFailed {
        /// The spec whose template failed.
        spec_id: String,
        /// The template engine's message.
        reason: String,
    },

    /// A backend call failed outside the start path (pause, resume).
    #[error("backend {operation} failed for proxy {proxy_id}")]
    BackendFailed {
        /// The proxy the call was for.
        proxy_id: String,
        /// The failed operation.
        operation: String,
        /// The underlying backend error.
        #[source]
        source: anyhow::Error,
    },

    /// A store operation failed.
    #[error("store operation failed: {source}")]
    Store {
        /// The underlying store error.
        #[source]
        source: anyhow::Error,
    },
}

impl ProxyError {
    /// Wrap a store failure
    #[must_use]
    pub fn store(source: anyhow::Error) -> Self {
        Self::Store { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_message() {
        let err = ProxyError::AccessDenied {
            user: "bob".to_owned(),
            spec_id: "s1".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bob"));
        assert!(msg.contains("s1"));
    }

    #[test]
    fn test_container_start_failed_carries_source() {
        let err = ProxyError::ContainerStartFailed {
            proxy_id: "p-1".to_owned(),
            source: anyhow::anyhow!("image pull backoff"),
        };
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("image pull backoff"));
    }

    #[test]
    fn test_illegal_state_message() {
        let err = ProxyError::IllegalState {
            subject: "p-2".to_owned(),
            operation: "pause".to_owned(),
            state: "Stopping".to_owned(),
        };
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("Stopping"));
    }
}
