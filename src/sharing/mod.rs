//! Pre-warmed seat pools for shared specs.
//!
//! Specs with a sharing extension get their proxies pre-started by a
//! per-spec scaler; user starts claim a ready seat instead of waiting on a
//! cold container start.

/// User-side seat claiming.
pub mod dispatcher;
/// Per-spec pool reconciler.
pub mod scaler;
/// Seat and delegate-proxy domain values.
pub mod seat;

pub use dispatcher::{ClaimantRegistry, SeatDispatcher};
pub use scaler::{ProxySharingScaler, ScalerDeps};
pub use seat::{DelegateProxy, Seat};
