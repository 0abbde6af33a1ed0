//! Core lifecycle engine and domain types.

/// Access-control gate on (user, spec) pairs.
pub mod access;
/// Domain error taxonomy.
pub mod errors;
/// Lifecycle events and the in-process event bus.
pub mod events;
/// Proxy domain model and status machine.
pub mod proxy;
/// Late-bound expression resolution over specs.
pub mod resolver;
/// Runtime value injection around resolution.
pub mod runtime_values;
/// Per-proxy state machine and orchestration.
pub mod service;
/// Proxy spec templates and the spec registry.
pub mod spec;

pub use access::{AccessControl, AuthContext};
pub use errors::ProxyError;
pub use events::{EventBus, ProxyEvent, ProxyEventKind, StartupLog};
pub use proxy::{Container, Proxy, ProxyInit, ProxyStatus};
pub use resolver::{ResolutionContext, SpecResolver};
pub use runtime_values::{RuntimeValue, RuntimeValueKey, RuntimeValueService};
pub use service::{Command, ProxyService, ProxyServiceDeps};
pub use spec::{
    AccessControlSpec, ContainerSpec, ParameterSpec, PortMapping, ProxySharingSpec, ProxySpec,
    SpecRegistry,
};
