//! Per-spec pool reconciler keeping a pre-warmed set of seats.
//!
//! One scaler runs per spec with a sharing extension. A single channel
//! carries reconcile signals; one worker drains it serially so scaling
//! decisions never race each other, while seat builds fan out onto their
//! own tasks and race only against the stores' atomicity.

use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::dispatcher::ClaimantRegistry;
use super::seat::{DelegateProxy, Seat};
use crate::backends::{ContainerBackend, TestStrategy, probe_until_ready};
use crate::config::{self, ProxyConfig};
use crate::core::events::{EventBus, ProxyEventKind};
use crate::core::proxy::{Container, Proxy, ProxyInit};
use crate::core::resolver::{ResolutionContext, SpecResolver};
use crate::core::runtime_values::{PUBLIC_PATH_KEY, RuntimeValue, RuntimeValueService};
use crate::core::spec::{ProxySharingSpec, ProxySpec};
use crate::leader::LeaderService;
use crate::store::{DelegateProxyStore, SeatStore};

/// A scaling decision trigger
#[derive(Debug)]
struct Reconcile;

/// Collaborators injected into [`ProxySharingScaler`].
#[derive(Clone)]
pub struct ScalerDeps {
    /// Seat pool store
    pub seat_store: Arc<dyn SeatStore>,
    /// Delegate records store
    pub delegate_store: Arc<dyn DelegateProxyStore>,
    /// Container driver
    pub backend: Arc<dyn ContainerBackend>,
    /// Spec expression resolver
    pub resolver: Arc<SpecResolver>,
    /// Readiness probe for fresh delegates
    pub test_strategy: Arc<dyn TestStrategy>,
    /// Single-writer election
    pub leader: Arc<dyn LeaderService>,
    /// Users waiting for a seat, shared with the dispatcher
    pub claimants: Arc<ClaimantRegistry>,
    /// Lifecycle event bus
    pub events: EventBus,
    /// Core configuration
    pub config: ProxyConfig,
}

impl std::fmt::Debug for ScalerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalerDeps").finish_non_exhaustive()
    }
}

/// Reconciles one spec's seat pool against its sharing configuration.
pub struct ProxySharingScaler {
    spec: Arc<ProxySpec>,
    sharing: ProxySharingSpec,
    seat_store: Arc<dyn SeatStore>,
    delegate_store: Arc<dyn DelegateProxyStore>,
    backend: Arc<dyn ContainerBackend>,
    resolver: Arc<SpecResolver>,
    runtime_values: RuntimeValueService,
    test_strategy: Arc<dyn TestStrategy>,
    leader: Arc<dyn LeaderService>,
    claimants: Arc<ClaimantRegistry>,
    events: EventBus,
    config: ProxyConfig,
    tx: mpsc::UnboundedSender<Reconcile>,
    /// Seat builds in flight. Shared with build tasks; reserved before a
    /// build is submitted so the next reconcile counts it.
    pending_delegates: Arc<DashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxySharingScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySharingScaler")
            .field("spec_id", &self.spec.id)
            .field("sharing", &self.sharing)
            .finish_non_exhaustive()
    }
}

impl ProxySharingScaler {
    /// Spawn a scaler for a spec with a sharing extension: the drain
    /// worker, the periodic tick, and the event pump.
    ///
    /// # Panics
    ///
    /// Panics when the spec carries no sharing extension; constructing a
    /// scaler for a non-shared spec is programmer error.
    #[must_use]
    pub fn spawn(spec: Arc<ProxySpec>, deps: ScalerDeps) -> Arc<Self> {
        let sharing = spec
            .sharing
            .expect("scaler requires a spec with a sharing extension");

        let (tx, rx) = mpsc::unbounded_channel();
        let scaler = Arc::new(Self {
            spec,
            sharing,
            seat_store: deps.seat_store,
            delegate_store: deps.delegate_store,
            backend: deps.backend,
            resolver: deps.resolver,
            runtime_values: RuntimeValueService::new(),
            test_strategy: deps.test_strategy,
            leader: deps.leader,
            claimants: deps.claimants,
            events: deps.events,
            config: deps.config,
            tx,
            pending_delegates: Arc::new(DashSet::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let worker = tokio::spawn(Arc::clone(&scaler).run_worker(rx));
        let tick = tokio::spawn(Arc::clone(&scaler).run_tick());
        let pump = tokio::spawn(Arc::clone(&scaler).run_event_pump());

        // Uncontended: nothing else can hold the lock before spawn returns
        if let Ok(mut tasks) = scaler.tasks.try_lock() {
            tasks.extend([worker, tick, pump]);
        }

        // Warm the pool without waiting for the first tick
        scaler.enqueue_reconcile();
        scaler
    }

    /// The spec this scaler reconciles
    #[must_use]
    pub fn spec_id(&self) -> &str {
        &self.spec.id
    }

    /// Number of seat builds currently in flight
    #[must_use]
    pub fn pending_build_count(&self) -> usize {
        self.pending_delegates.len()
    }

    /// Nudge the scaler to reconcile now
    pub fn enqueue_reconcile(&self) {
        let _ = self.tx.send(Reconcile);
    }

    /// Stop the worker, tick, and pump tasks. With
    /// `stop_proxies_on_shutdown` the pool's delegates are stopped
    /// best-effort and their seats removed.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        if !self.config.stop_proxies_on_shutdown {
            return;
        }

        let delegates = match self.delegate_store.list(&self.spec.id).await {
            Ok(delegates) => delegates,
            Err(e) => {
                tracing::error!(spec_id = %self.spec.id, error = %e, "Failed to list delegates on shutdown");
                return;
            }
        };

        tracing::info!(
            spec_id = %self.spec.id,
            count = delegates.len(),
            "Tearing down seat pool on shutdown"
        );
        for delegate in delegates {
            let seat_ids: Vec<Uuid> = delegate.seat_ids.iter().copied().collect();
            if let Err(e) = self.seat_store.remove_seats(&self.spec.id, &seat_ids).await {
                tracing::warn!(spec_id = %self.spec.id, error = %e, "Failed to remove seats on shutdown");
            }
            if let Err(e) = self.backend.stop_proxy(&delegate.proxy).await {
                tracing::warn!(
                    spec_id = %self.spec.id,
                    delegate_proxy_id = %delegate.proxy.id,
                    error = %e,
                    "Failed to stop delegate on shutdown"
                );
            }
            let _ = self
                .delegate_store
                .remove(&self.spec.id, &delegate.proxy.id)
                .await;
        }
    }

    /// Drain the signal channel serially; all scaling decisions for this
    /// spec pass through here.
    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Reconcile>) {
        while rx.recv().await.is_some() {
            if !self.leader.is_leader() {
                tracing::trace!(spec_id = %self.spec.id, "Not leader, discarding reconcile signal");
                continue;
            }

            if let Err(e) = self.reconcile().await {
                tracing::error!(spec_id = %self.spec.id, error = %e, "Reconcile failed");
            }
        }
    }

    /// Periodic reconcile tick
    async fn run_tick(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.tx.send(Reconcile).is_err() {
                return;
            }
        }
    }

    /// Translate bus events for this spec into signals
    async fn run_event_pump(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        spec_id = %self.spec.id,
                        skipped,
                        "Event pump lagged, forcing reconcile"
                    );
                    self.enqueue_reconcile();
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            if event.kind.spec_id() != self.spec.id {
                continue;
            }

            // A waiting user or a shrinking pool both warrant a decision
            let relevant = matches!(
                event.kind,
                ProxyEventKind::PendingProxy { .. } | ProxyEventKind::SeatClaimed { .. }
            );
            if relevant && self.tx.send(Reconcile).is_err() {
                return;
            }
        }
    }

    /// One scaling decision: compare desired vs. observed seat counts
    /// against the two moving populations (builds in flight, users
    /// awaiting a seat).
    async fn reconcile(self: &Arc<Self>) -> anyhow::Result<()> {
        let unclaimed = self.seat_store.unclaimed_count(&self.spec.id).await?;
        let pending_builds = self.pending_delegates.len();
        let pending_claimants = self.claimants.count(&self.spec.id);

        let gap = unclaimed as i64 + pending_builds as i64
            - i64::from(self.sharing.minimum_seats_available)
            - pending_claimants as i64;

        tracing::debug!(
            spec_id = %self.spec.id,
            unclaimed,
            pending_builds,
            pending_claimants,
            gap,
            "Reconciling seat pool"
        );

        if gap < 0 {
            for _ in 0..gap.unsigned_abs() {
                let id = Uuid::new_v4().to_string();
                // Reserve before submission so the next reconcile sees it
                self.pending_delegates.insert(id.clone());
                tracing::info!(spec_id = %self.spec.id, delegate_proxy_id = %id, "Launching seat build");
                tokio::spawn(Arc::clone(self).run_seat_creation(id));
            }
        } else if gap > i64::from(self.sharing.maximum_seats_available) {
            let surplus = (gap - i64::from(self.sharing.maximum_seats_available)) as usize;
            if self.config.enable_seat_scale_down {
                self.scale_down(surplus).await;
            } else {
                tracing::info!(
                    spec_id = %self.spec.id,
                    surplus,
                    "Seat pool over maximum; scale-down disabled"
                );
            }
        }

        Ok(())
    }

    /// One seat build. Whatever the outcome, the in-flight reservation is
    /// dropped and another reconcile is enqueued so underprovisioning
    /// self-heals.
    async fn run_seat_creation(self: Arc<Self>, id: String) {
        if let Err(e) = self.build_delegate(&id).await {
            tracing::error!(
                spec_id = %self.spec.id,
                delegate_proxy_id = %id,
                error = %e,
                "Seat build failed"
            );
            let _ = self.delegate_store.remove(&self.spec.id, &id).await;
        }

        self.pending_delegates.remove(&id);
        self.enqueue_reconcile();
    }

    /// Build one delegate proxy and publish its seat
    async fn build_delegate(&self, id: &str) -> anyhow::Result<()> {
        let spec = &self.spec;

        let mut proxy = Proxy::new(ProxyInit {
            id: id.to_owned(),
            spec_id: spec.id.clone(),
            user_id: None,
            display_name: spec.display_name.clone().unwrap_or_else(|| spec.id.clone()),
        });
        proxy.add_runtime_value(RuntimeValue::new(
            PUBLIC_PATH_KEY,
            format!("{}{}", config::public_path_prefix(), id),
        ));

        self.delegate_store
            .add(&spec.id, DelegateProxy::new(proxy.clone()))
            .await?;

        // Two-phase resolution: the second context sees the partially
        // resolved spec and the values derived from it
        self.runtime_values
            .add_runtime_values_before_resolution(&mut proxy, spec, None);
        let ctx = ResolutionContext::build(&proxy, spec, None);
        let first = spec.first_resolve(&self.resolver, &ctx)?;

        self.runtime_values
            .add_runtime_values_after_resolution(&mut proxy, &first);
        let ctx = ResolutionContext::build(&proxy, &first, None);
        let resolved = first.final_resolve(&self.resolver, &ctx)?;

        for index in 0..resolved.container_specs.len() {
            proxy.containers.push(Container::new(index));
        }

        let mut proxy = match self.backend.start_proxy(&proxy, &resolved).await {
            Ok(started) => started,
            Err(failure) => {
                if failure.partial_proxy.is_some() {
                    tracing::warn!(
                        spec_id = %spec.id,
                        delegate_proxy_id = %id,
                        "Seat build left partial container state behind"
                    );
                }
                return Err(failure.source);
            }
        };

        let responding = probe_until_ready(
            self.test_strategy.as_ref(),
            &proxy,
            self.config.probe_deadline(),
            self.config.probe_interval(),
        )
        .await;
        if !responding {
            // TODO(#pool-hygiene): sweep delegates that never became
            // healthy instead of leaving them in the pool
            tracing::warn!(
                spec_id = %spec.id,
                delegate_proxy_id = %id,
                "Delegate failed its readiness probe, publishing seat anyway"
            );
        }

        proxy.mark_up();

        let seat = Seat::new(proxy.id.clone());
        let mut delegate = DelegateProxy::new(proxy);
        delegate.seat_ids.insert(seat.id);
        self.delegate_store.update(&spec.id, delegate).await?;

        self.seat_store.add_seat(&spec.id, seat.clone()).await?;
        tracing::info!(
            spec_id = %spec.id,
            delegate_proxy_id = %id,
            seat_id = %seat.id,
            "Seat ready"
        );
        self.events.publish(ProxyEventKind::SeatAvailable {
            spec_id: spec.id.clone(),
            seat_id: seat.id,
        });

        Ok(())
    }

    /// Remove up to `count` delegates whose seats are all unclaimed. A
    /// seat claimed between listing and removal skips that candidate.
    async fn scale_down(&self, count: usize) {
        let delegates = match self.delegate_store.list(&self.spec.id).await {
            Ok(delegates) => delegates,
            Err(e) => {
                tracing::error!(spec_id = %self.spec.id, error = %e, "Failed to list delegates for scale-down");
                return;
            }
        };

        let mut removed = 0;
        for delegate in delegates {
            if removed == count {
                break;
            }
            if delegate.seat_ids.is_empty() {
                continue;
            }

            let seat_ids: Vec<Uuid> = delegate.seat_ids.iter().copied().collect();
            match self.seat_store.remove_seats(&self.spec.id, &seat_ids).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        spec_id = %self.spec.id,
                        delegate_proxy_id = %delegate.proxy.id,
                        "Scale-down candidate claimed in the meantime, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(spec_id = %self.spec.id, error = %e, "Seat removal failed");
                    continue;
                }
            }

            if let Err(e) = self.backend.stop_proxy(&delegate.proxy).await {
                tracing::warn!(
                    spec_id = %self.spec.id,
                    delegate_proxy_id = %delegate.proxy.id,
                    error = %e,
                    "Failed to stop delegate during scale-down"
                );
            }
            if let Err(e) = self
                .delegate_store
                .remove(&self.spec.id, &delegate.proxy.id)
                .await
            {
                tracing::warn!(spec_id = %self.spec.id, error = %e, "Failed to remove delegate record");
            }

            removed += 1;
            tracing::info!(
                spec_id = %self.spec.id,
                delegate_proxy_id = %delegate.proxy.id,
                "Scaled down one seat"
            );
        }
    }
}
