//! User-side seat claiming for shared specs.
//!
//! The dispatcher announces a waiting user, attempts an atomic claim, and
//! on a miss blocks on seat-availability notifications until the wait
//! deadline. The spec's scaler observes the announcement and makes sure a
//! build is in flight; the two only ever talk through the event bus, the
//! seat store, and the claimant registry.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::seat::{DelegateProxy, Seat};
use crate::config::ProxyConfig;
use crate::core::errors::ProxyError;
use crate::core::events::{EventBus, ProxyEventKind};
use crate::core::proxy::Proxy;
use crate::core::runtime_values::SEAT_ID_KEY;
use crate::store::{DelegateProxyStore, SeatStore};

/// Users currently waiting for a seat, per spec. Written by the
/// dispatcher (insert on claim miss, remove on claim or timeout), read by
/// the scalers' reconcile arithmetic.
#[derive(Debug, Default)]
pub struct ClaimantRegistry {
    waiting: DashMap<String, DashSet<String>>,
}

impl ClaimantRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a proxy as waiting for a seat of `spec_id`
    pub fn insert(&self, spec_id: &str, proxy_id: &str) {
        self.waiting
            .entry(spec_id.to_owned())
            .or_default()
            .insert(proxy_id.to_owned());
    }

    /// Drop a proxy from the waiting set
    pub fn remove(&self, spec_id: &str, proxy_id: &str) {
        if let Some(set) = self.waiting.get(spec_id) {
            set.remove(proxy_id);
        }
    }

    /// Number of proxies waiting for a seat of `spec_id`
    #[must_use]
    pub fn count(&self, spec_id: &str) -> usize {
        self.waiting.get(spec_id).map_or(0, |set| set.len())
    }
}

/// Claims and releases seats on behalf of delegating proxies.
#[derive(Clone)]
pub struct SeatDispatcher {
    seat_store: Arc<dyn SeatStore>,
    delegate_store: Arc<dyn DelegateProxyStore>,
    claimants: Arc<ClaimantRegistry>,
    events: EventBus,
    config: ProxyConfig,
}

impl std::fmt::Debug for SeatDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeatDispatcher").finish_non_exhaustive()
    }
}

impl SeatDispatcher {
    /// Create a dispatcher over the given pool stores
    #[must_use]
    pub fn new(
        seat_store: Arc<dyn SeatStore>,
        delegate_store: Arc<dyn DelegateProxyStore>,
        claimants: Arc<ClaimantRegistry>,
        events: EventBus,
        config: ProxyConfig,
    ) -> Self {
        Self {
            seat_store,
            delegate_store,
            claimants,
            events,
            config,
        }
    }

    /// Claim a seat for a delegating proxy, waiting for one to become
    /// available up to the configured deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ContainerStartFailed`] when the deadline
    /// expires without a claim, [`ProxyError::Store`] on store failures.
    pub async fn acquire_seat(
        &self,
        proxy: &Proxy,
    ) -> Result<(Seat, DelegateProxy), ProxyError> {
        let spec_id = proxy.spec_id.as_str();

        // Subscribe before announcing, so an availability published between
        // the first claim attempt and the wait is not missed.
        let mut rx = self.events.subscribe();

        self.events.publish(ProxyEventKind::PendingProxy {
            proxy_id: proxy.id.clone(),
            user_id: proxy.user_id.clone(),
            spec_id: spec_id.to_owned(),
        });

        let deadline = tokio::time::Instant::now() + self.config.seat_wait_timeout();
        let mut waiting = false;

        let result = loop {
            match self.try_claim(proxy, spec_id).await {
                Ok(Some(claimed)) => break Ok(claimed),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            // Missed: enter the waiting population the scaler provisions for
            if !waiting {
                self.claimants.insert(spec_id, &proxy.id);
                waiting = true;
            }

            if let Err(e) = self
                .wait_for_availability(proxy, spec_id, deadline, &mut rx)
                .await
            {
                break Err(e);
            }
        };

        if waiting {
            self.claimants.remove(spec_id, &proxy.id);
        }
        result
    }

    /// One atomic claim attempt, resolving the delegate record on a hit
    async fn try_claim(
        &self,
        proxy: &Proxy,
        spec_id: &str,
    ) -> Result<Option<(Seat, DelegateProxy)>, ProxyError> {
        let Some(seat) = self
            .seat_store
            .claim_seat(spec_id)
            .await
            .map_err(ProxyError::store)?
        else {
            return Ok(None);
        };

        match self
            .delegate_store
            .get(spec_id, &seat.delegate_proxy_id)
            .await
        {
            Ok(Some(delegate)) => {
                tracing::info!(
                    proxy_id = %proxy.id,
                    spec_id = %spec_id,
                    seat_id = %seat.id,
                    delegate_proxy_id = %seat.delegate_proxy_id,
                    "Claimed seat"
                );
                self.events.publish(ProxyEventKind::SeatClaimed {
                    spec_id: spec_id.to_owned(),
                    seat_id: seat.id,
                    delegate_proxy_id: seat.delegate_proxy_id.clone(),
                    claimant_proxy_id: proxy.id.clone(),
                });
                Ok(Some((seat, delegate)))
            }
            Ok(None) => {
                // Seat without a delegate record: drop it back and keep
                // waiting rather than binding to nothing
                tracing::error!(
                    spec_id = %spec_id,
                    seat_id = %seat.id,
                    delegate_proxy_id = %seat.delegate_proxy_id,
                    "Claimed seat has no delegate record, releasing"
                );
                let _ = self.seat_store.release_seat(spec_id, seat.id).await;
                Ok(None)
            }
            Err(e) => Err(ProxyError::store(e)),
        }
    }

    /// Block until a seat for `spec_id` is announced or the deadline passes
    async fn wait_for_availability(
        &self,
        proxy: &Proxy,
        spec_id: &str,
        deadline: tokio::time::Instant,
        rx: &mut tokio::sync::broadcast::Receiver<crate::core::events::ProxyEvent>,
    ) -> Result<(), ProxyError> {
        loop {
            let timeout_err = || ProxyError::ContainerStartFailed {
                proxy_id: proxy.id.clone(),
                source: anyhow::anyhow!(
                    "no seat for spec {} became available within {:?}",
                    spec_id,
                    self.config.seat_wait_timeout()
                ),
            };

            let Some(remaining) =
                deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return Err(timeout_err());
            };

            match tokio::time::timeout(remaining, rx.recv()).await {
                Err(_elapsed) => return Err(timeout_err()),
                Ok(Ok(event)) => {
                    if matches!(
                        &event.kind,
                        ProxyEventKind::SeatAvailable { spec_id: s, .. } if s == spec_id
                    ) {
                        return Ok(());
                    }
                }
                // Lagged: availability may have been dropped, retry a claim
                Ok(Err(RecvError::Lagged(_))) => return Ok(()),
                Ok(Err(RecvError::Closed)) => {
                    return Err(ProxyError::ContainerStartFailed {
                        proxy_id: proxy.id.clone(),
                        source: anyhow::anyhow!("event bus closed while waiting for a seat"),
                    });
                }
            }
        }
    }

    /// Release the seat a delegating proxy claimed, returning it to the
    /// unclaimed pool and waking waiting claimants.
    ///
    /// # Errors
    ///
    /// Fails when the proxy carries no seat id or the store rejects the
    /// release.
    pub async fn release_seat(&self, proxy: &Proxy) -> anyhow::Result<()> {
        let Some(value) = proxy.runtime_value(SEAT_ID_KEY.id) else {
            anyhow::bail!("proxy {} holds no seat", proxy.id);
        };
        let seat_id: Uuid = value.value_as_string().parse()?;

        self.seat_store
            .release_seat(&proxy.spec_id, seat_id)
            .await?;

        tracing::info!(
            proxy_id = %proxy.id,
            spec_id = %proxy.spec_id,
            seat_id = %seat_id,
            "Released seat"
        );
        self.events.publish(ProxyEventKind::SeatAvailable {
            spec_id: proxy.spec_id.clone(),
            seat_id,
        });
        Ok(())
    }
}
