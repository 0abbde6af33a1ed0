//! In-memory store implementations backing single-instance deployments
//! and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DelegateProxyStore, ProxyStore, SeatStore};
use crate::core::proxy::Proxy;
use crate::sharing::seat::{DelegateProxy, Seat};

/// In-memory [`ProxyStore`] with compare-and-set updates.
#[derive(Debug, Default)]
pub struct MemoryProxyStore {
    proxies: Mutex<HashMap<String, Proxy>>,
}

impl MemoryProxyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn add(&self, proxy: Proxy) -> anyhow::Result<()> {
        let mut proxies = self.proxies.lock().await;
        if proxies.contains_key(&proxy.id) {
            anyhow::bail!("proxy {} already exists", proxy.id);
        }
        proxies.insert(proxy.id.clone(), proxy);
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Proxy>> {
        Ok(self.proxies.lock().await.get(id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Proxy>> {
        Ok(self.proxies.lock().await.values().cloned().collect())
    }

    async fn update(&self, mut proxy: Proxy) -> anyhow::Result<Proxy> {
        let mut proxies = self.proxies.lock().await;
        let Some(current) = proxies.get(&proxy.id) else {
            anyhow::bail!("proxy {} is gone", proxy.id);
        };
        if current.version != proxy.version {
            anyhow::bail!(
                "stale update for proxy {}: stored version {}, observed {}",
                proxy.id,
                current.version,
                proxy.version
            );
        }
        proxy.version += 1;
        proxies.insert(proxy.id.clone(), proxy.clone());
        Ok(proxy)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<Option<Proxy>> {
        Ok(self.proxies.lock().await.remove(id))
    }
}

/// A seat and its claim status
#[derive(Debug, Clone)]
struct SeatSlot {
    seat: Seat,
    claimed: bool,
}

/// In-memory [`SeatStore`]. All operations take the pool lock, making
/// claim test-and-set atomic.
#[derive(Debug, Default)]
pub struct MemorySeatStore {
    pools: Mutex<HashMap<String, Vec<SeatSlot>>>,
}

impl MemorySeatStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SeatStore for MemorySeatStore {
    async fn add_seat(&self, spec_id: &str, seat: Seat) -> anyhow::Result<()> {
        self.pools
            .lock()
            .await
            .entry(spec_id.to_owned())
            .or_default()
            .push(SeatSlot {
                seat,
                claimed: false,
            });
        Ok(())
    }

    async fn claim_seat(&self, spec_id: &str) -> anyhow::Result<Option<Seat>> {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(spec_id) else {
            return Ok(None);
        };
        for slot in pool.iter_mut() {
            if !slot.claimed {
                slot.claimed = true;
                return Ok(Some(slot.seat.clone()));
            }
        }
        Ok(None)
    }

    async fn release_seat(&self, spec_id: &str, seat_id: Uuid) -> anyhow::Result<()> {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(spec_id) else {
            anyhow::bail!("no seat pool for spec {spec_id}");
        };
        let Some(slot) = pool.iter_mut().find(|s| s.seat.id == seat_id) else {
            anyhow::bail!("seat {seat_id} not found for spec {spec_id}");
        };
        slot.claimed = false;
        Ok(())
    }

    async fn remove_seats(&self, spec_id: &str, seat_ids: &[Uuid]) -> anyhow::Result<bool> {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(spec_id) else {
            return Ok(false);
        };

        // All listed seats must be present and unclaimed, or nothing moves
        for seat_id in seat_ids {
            match pool.iter().find(|s| s.seat.id == *seat_id) {
                Some(slot) if !slot.claimed => {}
                _ => return Ok(false),
            }
        }

        pool.retain(|s| !seat_ids.contains(&s.seat.id));
        Ok(true)
    }

    async fn unclaimed_count(&self, spec_id: &str) -> anyhow::Result<usize> {
        Ok(self
            .pools
            .lock()
            .await
            .get(spec_id)
            .map_or(0, |pool| pool.iter().filter(|s| !s.claimed).count()))
    }

    async fn claimed_count(&self, spec_id: &str) -> anyhow::Result<usize> {
        Ok(self
            .pools
            .lock()
            .await
            .get(spec_id)
            .map_or(0, |pool| pool.iter().filter(|s| s.claimed).count()))
    }
}

/// In-memory [`DelegateProxyStore`].
#[derive(Debug, Default)]
pub struct MemoryDelegateProxyStore {
    delegates: Mutex<HashMap<String, HashMap<String, DelegateProxy>>>,
}

impl MemoryDelegateProxyStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelegateProxyStore for MemoryDelegateProxyStore {
    async fn add(&self, spec_id: &str, delegate: DelegateProxy) -> anyhow::Result<()> {
        let mut delegates = self.delegates.lock().await;
        let pool = delegates.entry(spec_id.to_owned()).or_default();
        let id = delegate.proxy.id.clone();
        if pool.contains_key(&id) {
            anyhow::bail!("delegate proxy {id} already exists for spec {spec_id}");
        }
        pool.insert(id, delegate);
        Ok(())
    }

    async fn update(&self, spec_id: &str, delegate: DelegateProxy) -> anyhow::Result<()> {
        let mut delegates = self.delegates.lock().await;
        let Some(pool) = delegates.get_mut(spec_id) else {
            anyhow::bail!("no delegate pool for spec {spec_id}");
        };
        let id = delegate.proxy.id.clone();
        if !pool.contains_key(&id) {
            anyhow::bail!("delegate proxy {id} not found for spec {spec_id}");
        }
        pool.insert(id, delegate);
        Ok(())
    }

    async fn remove(&self, spec_id: &str, proxy_id: &str) -> anyhow::Result<()> {
        let mut delegates = self.delegates.lock().await;
        if let Some(pool) = delegates.get_mut(spec_id) {
            pool.remove(proxy_id);
        }
        Ok(())
    }

    async fn get(&self, spec_id: &str, proxy_id: &str) -> anyhow::Result<Option<DelegateProxy>> {
        Ok(self
            .delegates
            .lock()
            .await
            .get(spec_id)
            .and_then(|pool| pool.get(proxy_id))
            .cloned())
    }

    async fn list(&self, spec_id: &str) -> anyhow::Result<Vec<DelegateProxy>> {
        Ok(self
            .delegates
            .lock()
            .await
            .get(spec_id)
            .map(|pool| pool.values().cloned().collect())
            .unwrap_or_default())
    }
}
