//! Portico: lifecycle and pool-scaling core for container-backed
//! application proxies.
//!
//! Authenticated users request interactive proxies: short-lived groups of
//! containers fronted by reverse-proxy routes. This crate mediates every
//! state transition of a proxy, serializes mutations against a shared
//! store, publishes observable events for each transition, and maintains
//! pre-warmed pools of interchangeable seats for specs configured for
//! sharing.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// Container backend and readiness probe interfaces.
pub mod backends;
/// Core configuration loading.
pub mod config;
/// Lifecycle engine and domain types.
pub mod core;
/// Single-writer election for pool mutations.
pub mod leader;
/// Route registry consumed by the HTTP layer.
pub mod routing;
/// Pre-warmed seat pools for shared specs.
pub mod sharing;
/// Storage interfaces and in-memory implementations.
pub mod store;
