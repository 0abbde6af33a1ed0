use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::core::proxy::Proxy;

/// A reservation of a pre-warmed delegate proxy that a user proxy can
/// claim. Claim and release are status changes inside the seat store;
/// seats are created and destroyed only together with their delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    /// Unique seat identifier
    pub id: Uuid,

    /// The pool-owned proxy whose containers back this seat
    pub delegate_proxy_id: String,
}

impl Seat {
    /// Create a seat backed by the given delegate proxy
    #[must_use]
    pub fn new(delegate_proxy_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            delegate_proxy_id: delegate_proxy_id.into(),
        }
    }
}

/// A pool-owned proxy and the seats it backs. Owned exclusively by the
/// scaler of its spec; no user-facing endpoint refers to it.
///
/// The simple pool form carries exactly one seat per delegate; the set
/// leaves room for multi-seat containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateProxy {
    /// The pool-owned proxy
    pub proxy: Proxy,

    /// Seats backed by this delegate
    pub seat_ids: BTreeSet<Uuid>,
}

impl DelegateProxy {
    /// Wrap a freshly built delegate proxy with no seats yet
    #[must_use]
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            seat_ids: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::ProxyInit;

    #[test]
    fn test_seat_ids_are_unique() {
        let a = Seat::new("d-1");
        let b = Seat::new("d-1");
        assert_ne!(a.id, b.id);
        assert_eq!(a.delegate_proxy_id, b.delegate_proxy_id);
    }

    #[test]
    fn test_new_delegate_has_no_seats() {
        let proxy = Proxy::new(ProxyInit {
            id: "d-1".to_owned(),
            spec_id: "s1".to_owned(),
            user_id: None,
            display_name: "s1".to_owned(),
        });
        let delegate = DelegateProxy::new(proxy);
        assert!(delegate.seat_ids.is_empty());
    }
}
