//! Storage interfaces for proxies, seats, and pool-owned delegates.
//!
//! Persistence implementations (Redis, database) live outside this crate;
//! the core consumes the traits and ships in-memory implementations whose
//! synchronization the rest of the system relies on: per-proxy updates are
//! compare-and-set, seat claims are atomic.

/// In-memory store implementations.
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::proxy::Proxy;
use crate::sharing::seat::{DelegateProxy, Seat};

pub use memory::{MemoryDelegateProxyStore, MemoryProxyStore, MemorySeatStore};

/// Authoritative set of live proxies.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Insert a new proxy.
    ///
    /// Fails when the id is already present; callers rely on this for
    /// idempotent starts.
    async fn add(&self, proxy: Proxy) -> anyhow::Result<()>;

    /// Get a proxy by id
    async fn get(&self, id: &str) -> anyhow::Result<Option<Proxy>>;

    /// All live proxies
    async fn list(&self) -> anyhow::Result<Vec<Proxy>>;

    /// Replace a proxy, compare-and-set on its `version`.
    ///
    /// Returns the stored copy with the version bumped. Fails when the
    /// stored version differs from the one the caller observed, or when
    /// the proxy is gone.
    async fn update(&self, proxy: Proxy) -> anyhow::Result<Proxy>;

    /// Remove a proxy, returning the removed record when it existed
    async fn remove(&self, id: &str) -> anyhow::Result<Option<Proxy>>;
}

/// Pool of seats per shared spec. Claim and release are atomic status
/// changes; the total seat count only moves through add and remove.
#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Add a new unclaimed seat to a spec's pool
    async fn add_seat(&self, spec_id: &str, seat: Seat) -> anyhow::Result<()>;

    /// Atomically claim an unclaimed seat, if any
    async fn claim_seat(&self, spec_id: &str) -> anyhow::Result<Option<Seat>>;

    /// Return a claimed seat to the unclaimed pool
    async fn release_seat(&self, spec_id: &str, seat_id: Uuid) -> anyhow::Result<()>;

    /// Atomically remove the given seats.
    ///
    /// Returns false without removing anything when any of them is
    /// currently claimed (or missing); scale-down uses this to skip
    /// candidates that were claimed in the meantime.
    async fn remove_seats(&self, spec_id: &str, seat_ids: &[Uuid]) -> anyhow::Result<bool>;

    /// Number of unclaimed seats for a spec
    async fn unclaimed_count(&self, spec_id: &str) -> anyhow::Result<usize>;

    /// Number of claimed seats for a spec
    async fn claimed_count(&self, spec_id: &str) -> anyhow::Result<usize>;
}

/// Pool-owned proxy records and their seat ids, keyed by spec.
#[async_trait]
pub trait DelegateProxyStore: Send + Sync {
    /// Insert a delegate record
    async fn add(&self, spec_id: &str, delegate: DelegateProxy) -> anyhow::Result<()>;

    /// Replace a delegate record
    async fn update(&self, spec_id: &str, delegate: DelegateProxy) -> anyhow::Result<()>;

    /// Remove a delegate record by proxy id
    async fn remove(&self, spec_id: &str, proxy_id: &str) -> anyhow::Result<()>;

    /// Get a delegate record by proxy id
    async fn get(&self, spec_id: &str, proxy_id: &str) -> anyhow::Result<Option<DelegateProxy>>;

    /// All delegate records for a spec
    async fn list(&self, spec_id: &str) -> anyhow::Result<Vec<DelegateProxy>>;
}
