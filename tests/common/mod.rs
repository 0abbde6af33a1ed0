//! Shared wiring for integration tests: the full service assembled over
//! in-memory stores and mock backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use portico::backends::{ContainerBackend, MockContainerBackend, MockTestStrategy, TestStrategy};
use portico::config::ProxyConfig;
use portico::core::events::{EventBus, ProxyEvent};
use portico::core::{AccessControl, ProxyService, ProxyServiceDeps, SpecRegistry, SpecResolver};
use portico::leader::{LeaderService, StaticLeaderService};
use portico::routing::MappingManager;
use portico::sharing::{ClaimantRegistry, ProxySharingScaler, ScalerDeps, SeatDispatcher};
use portico::store::{
    DelegateProxyStore, MemoryDelegateProxyStore, MemoryProxyStore, MemorySeatStore, ProxyStore,
    SeatStore,
};

/// Configuration with short budgets so failure paths finish quickly
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        probe_deadline_secs: 2,
        probe_interval_secs: 1,
        seat_wait_timeout_secs: 2,
        reconcile_interval_secs: 1,
        ..ProxyConfig::default()
    }
}

/// The full core wired over mocks and in-memory stores
pub struct Harness {
    pub service: Arc<ProxyService>,
    pub store: Arc<MemoryProxyStore>,
    pub seat_store: Arc<MemorySeatStore>,
    pub delegate_store: Arc<MemoryDelegateProxyStore>,
    pub backend: Arc<MockContainerBackend>,
    pub probe: Arc<MockTestStrategy>,
    pub mapping: Arc<MappingManager>,
    pub registry: Arc<SpecRegistry>,
    pub claimants: Arc<ClaimantRegistry>,
    pub leader: Arc<StaticLeaderService>,
    pub events: EventBus,
    pub resolver: Arc<SpecResolver>,
    pub config: ProxyConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        init_tracing();

        let store = Arc::new(MemoryProxyStore::new());
        let seat_store = Arc::new(MemorySeatStore::new());
        let delegate_store = Arc::new(MemoryDelegateProxyStore::new());
        let backend = Arc::new(MockContainerBackend::new());
        let probe = Arc::new(MockTestStrategy::always_up());
        let mapping = Arc::new(MappingManager::new());
        let registry = Arc::new(SpecRegistry::new());
        let claimants = Arc::new(ClaimantRegistry::new());
        let leader = Arc::new(StaticLeaderService::new(true));
        let events = EventBus::new("test-instance");
        let resolver = Arc::new(SpecResolver::new());

        let dispatcher = Arc::new(SeatDispatcher::new(
            Arc::clone(&seat_store) as Arc<dyn SeatStore>,
            Arc::clone(&delegate_store) as Arc<dyn DelegateProxyStore>,
            Arc::clone(&claimants),
            events.clone(),
            config.clone(),
        ));

        let service = Arc::new(ProxyService::new(ProxyServiceDeps {
            store: Arc::clone(&store) as Arc<dyn ProxyStore>,
            backend: Arc::clone(&backend) as Arc<dyn ContainerBackend>,
            mapping: Arc::clone(&mapping),
            registry: Arc::clone(&registry),
            access: Arc::new(AccessControl::new(Arc::clone(&registry), true)),
            resolver: Arc::clone(&resolver),
            test_strategy: Arc::clone(&probe) as Arc<dyn TestStrategy>,
            dispatcher: Some(dispatcher),
            events: events.clone(),
            config: config.clone(),
        }));

        Self {
            service,
            store,
            seat_store,
            delegate_store,
            backend,
            probe,
            mapping,
            registry,
            claimants,
            leader,
            events,
            resolver,
            config,
        }
    }

    /// Spawn a scaler for a registered shared spec, wired to the same
    /// stores and bus as the service
    pub fn spawn_scaler(&self, spec_id: &str) -> Arc<ProxySharingScaler> {
        let spec = self
            .registry
            .get(spec_id)
            .expect("spec must be registered before spawning its scaler");
        ProxySharingScaler::spawn(
            spec,
            ScalerDeps {
                seat_store: Arc::clone(&self.seat_store) as Arc<dyn SeatStore>,
                delegate_store: Arc::clone(&self.delegate_store) as Arc<dyn DelegateProxyStore>,
                backend: Arc::clone(&self.backend) as Arc<dyn ContainerBackend>,
                resolver: Arc::clone(&self.resolver),
                test_strategy: Arc::clone(&self.probe) as Arc<dyn TestStrategy>,
                leader: Arc::clone(&self.leader) as Arc<dyn LeaderService>,
                claimants: Arc::clone(&self.claimants),
                events: self.events.clone(),
                config: self.config.clone(),
            },
        )
    }
}

/// Route test logs through the test writer, once per process
fn init_tracing() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll a condition until it holds or five seconds pass
pub async fn wait_for(what: &str, mut condition: impl AsyncFnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Drain all events currently buffered on a subscription
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<ProxyEvent>) -> Vec<ProxyEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
