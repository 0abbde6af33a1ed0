//! Per-proxy state machine and orchestration.
//!
//! Every public operation splits into a synchronous reserve-and-validate
//! phase and a deferred [`Command`] the caller schedules. The split lets
//! the HTTP layer answer before containers are ready and lets the seat
//! pool race a warm seat against a pending build; do not collapse it into
//! one blocking call.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::instrument;

use super::access::{AccessControl, AuthContext};
use super::errors::ProxyError;
use super::events::{EventBus, ProxyEventKind, StartupLog};
use super::proxy::{Proxy, ProxyInit, ProxyStatus};
use super::resolver::{ResolutionContext, SpecResolver};
use super::runtime_values::{RuntimeValue, RuntimeValueService, SEAT_ID_KEY};
use super::spec::{ProxySpec, SpecRegistry};
use crate::backends::{ContainerBackend, TestStrategy, probe_until_ready};
use crate::config::ProxyConfig;
use crate::routing::MappingManager;
use crate::sharing::dispatcher::SeatDispatcher;
use crate::store::ProxyStore;

/// A deferred lifecycle operation. The synchronous phase has already
/// reserved and validated; running the command performs the backend work
/// and resolves to the final proxy.
pub struct Command {
    proxy_id: String,
    fut: Pin<Box<dyn Future<Output = Result<Proxy, ProxyError>> + Send + 'static>>,
}

impl Command {
    fn new(
        proxy_id: String,
        fut: impl Future<Output = Result<Proxy, ProxyError>> + Send + 'static,
    ) -> Self {
        Self {
            proxy_id,
            fut: Box::pin(fut),
        }
    }

    /// The proxy this command operates on
    #[must_use]
    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Execute the deferred phase.
    ///
    /// # Errors
    ///
    /// Returns the operation's failure after rollback has run; see the
    /// individual service operations for the guarantees.
    pub async fn run(self) -> Result<Proxy, ProxyError> {
        self.fut.await
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("proxy_id", &self.proxy_id)
            .finish_non_exhaustive()
    }
}

/// Collaborators injected into [`ProxyService`].
#[derive(Clone)]
pub struct ProxyServiceDeps {
    /// Authoritative proxy records
    pub store: Arc<dyn ProxyStore>,
    /// Container driver
    pub backend: Arc<dyn ContainerBackend>,
    /// Route registry
    pub mapping: Arc<MappingManager>,
    /// Registered specs
    pub registry: Arc<SpecRegistry>,
    /// (user, spec) gate
    pub access: Arc<AccessControl>,
    /// Spec expression resolver
    pub resolver: Arc<SpecResolver>,
    /// Readiness probe
    pub test_strategy: Arc<dyn TestStrategy>,
    /// Seat claiming for shared specs; `None` disables sharing
    pub dispatcher: Option<Arc<SeatDispatcher>>,
    /// Lifecycle event sink
    pub events: EventBus,
    /// Core configuration
    pub config: ProxyConfig,
}

impl std::fmt::Debug for ProxyServiceDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServiceDeps").finish_non_exhaustive()
    }
}

/// The per-proxy lifecycle engine.
///
/// State transitions are single-writer per proxy id: writers observe the
/// current record and update through the store's compare-and-set, so a
/// lost race surfaces as a store error instead of a silent overwrite.
pub struct ProxyService {
    store: Arc<dyn ProxyStore>,
    backend: Arc<dyn ContainerBackend>,
    mapping: Arc<MappingManager>,
    registry: Arc<SpecRegistry>,
    access: Arc<AccessControl>,
    resolver: Arc<SpecResolver>,
    runtime_values: RuntimeValueService,
    test_strategy: Arc<dyn TestStrategy>,
    dispatcher: Option<Arc<SeatDispatcher>>,
    events: EventBus,
    config: ProxyConfig,
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService").finish_non_exhaustive()
    }
}

impl ProxyService {
    /// Create the service from its collaborators
    #[must_use]
    pub fn new(deps: ProxyServiceDeps) -> Self {
        Self {
            store: deps.store,
            backend: deps.backend,
            mapping: deps.mapping,
            registry: deps.registry,
            access: deps.access,
            resolver: deps.resolver,
            runtime_values: RuntimeValueService::new(),
            test_strategy: deps.test_strategy,
            dispatcher: deps.dispatcher,
            events: deps.events,
            config: deps.config,
        }
    }

    /// All live proxies
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Store`] when the store fails.
    pub async fn get_proxies(&self) -> Result<Vec<Proxy>, ProxyError> {
        self.store.list().await.map_err(ProxyError::store)
    }

    /// A live proxy by id
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Store`] when the store fails.
    pub async fn get_proxy(&self, id: &str) -> Result<Option<Proxy>, ProxyError> {
        self.store.get(id).await.map_err(ProxyError::store)
    }

    /// Reserve and validate a proxy start; the returned command performs
    /// the container work.
    ///
    /// The proxy id is caller-supplied so a retried request maps onto the
    /// same reservation instead of a second container group.
    ///
    /// # Errors
    ///
    /// [`ProxyError::AccessDenied`] when the gate rejects the user,
    /// [`ProxyError::InvalidParameters`] when parameter validation fails,
    /// [`ProxyError::IllegalState`] when the id is already reserved.
    #[instrument(skip(self, spec, runtime_values, parameters), fields(spec_id = %spec.id, proxy_id = %proxy_id))]
    pub async fn start_proxy(
        self: &Arc<Self>,
        auth: &AuthContext,
        spec: Arc<ProxySpec>,
        runtime_values: Vec<RuntimeValue>,
        proxy_id: &str,
        parameters: Option<HashMap<String, String>>,
    ) -> Result<Command, ProxyError> {
        if !self.access.can_access(Some(auth), Some(&spec)) {
            return Err(ProxyError::AccessDenied {
                user: auth.user_id.clone(),
                spec_id: spec.id.clone(),
            });
        }

        let mut proxy = Proxy::new(ProxyInit {
            id: proxy_id.to_owned(),
            spec_id: spec.id.clone(),
            user_id: Some(auth.user_id.clone()),
            display_name: spec.display_name.clone().unwrap_or_else(|| spec.id.clone()),
        });

        for value in runtime_values {
            proxy.add_runtime_value(value);
        }

        process_parameters(&mut proxy, &spec, parameters.as_ref())?;

        self.store
            .add(proxy.clone())
            .await
            .map_err(|_| ProxyError::IllegalState {
                subject: proxy_id.to_owned(),
                operation: "start".to_owned(),
                state: "already reserved".to_owned(),
            })?;

        let service = Arc::clone(self);
        let auth = auth.clone();
        let id = proxy.id.clone();
        Ok(Command::new(id, async move {
            match (&spec.sharing, service.dispatcher.clone()) {
                (Some(_), Some(dispatcher)) => {
                    service
                        .run_shared_start(proxy, &spec, &auth, &dispatcher)
                        .await
                }
                _ => service.run_start(proxy, &spec, &auth).await,
            }
        }))
    }

    /// Deferred phase of a non-shared start
    async fn run_start(
        &self,
        proxy: Proxy,
        spec: &ProxySpec,
        auth: &AuthContext,
    ) -> Result<Proxy, ProxyError> {
        let mut proxy = self.transition(proxy, ProxyStatus::Starting).await?;
        let mut startup_log = StartupLog::default();

        let clock = tokio::time::Instant::now();
        let resolved = match self.prepare_proxy_for_start(&mut proxy, spec, Some(auth)) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.rollback_start(&proxy, true).await;
                return Err(e);
            }
        };
        startup_log.prepare = Some(clock.elapsed());

        let clock = tokio::time::Instant::now();
        let started = match self.backend.start_proxy(&proxy, &resolved).await {
            Ok(started) => started,
            Err(failure) => {
                if let Some(partial) = &failure.partial_proxy {
                    if let Err(e) = self.backend.stop_proxy(partial).await {
                        tracing::warn!(
                            proxy_id = %proxy.id,
                            error = %e,
                            "Failed to stop partially started container"
                        );
                    }
                }
                self.rollback_start(&proxy, false).await;
                return Err(ProxyError::ContainerStartFailed {
                    proxy_id: proxy.id.clone(),
                    source: failure.source,
                });
            }
        };
        let mut proxy = started;
        startup_log.container_start = Some(clock.elapsed());

        let clock = tokio::time::Instant::now();
        let responding = probe_until_ready(
            self.test_strategy.as_ref(),
            &proxy,
            self.config.probe_deadline(),
            self.config.probe_interval(),
        )
        .await;
        startup_log.probe = Some(clock.elapsed());

        if !responding {
            self.rollback_start(&proxy, true).await;
            return Err(ProxyError::NotResponding {
                proxy_id: proxy.id.clone(),
            });
        }

        proxy.mark_up();
        let proxy = match self.store.update(proxy.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                // Lost the record mid-start (e.g. a concurrent stop); the
                // container must not outlive it
                self.rollback_start(&proxy, true).await;
                return Err(ProxyError::store(e));
            }
        };

        if let Err(e) = self.mapping.register_proxy(&proxy) {
            self.rollback_start(&proxy, true).await;
            return Err(e);
        }

        tracing::info!(
            proxy_id = %proxy.id,
            spec_id = %proxy.spec_id,
            "Proxy is up"
        );
        self.events.publish(ProxyEventKind::ProxyStart {
            proxy_id: proxy.id.clone(),
            user_id: proxy.user_id.clone(),
            spec_id: proxy.spec_id.clone(),
            startup_log,
        });
        Ok(proxy)
    }

    /// Deferred phase of a start against a shared spec: claim a seat
    /// instead of starting containers.
    async fn run_shared_start(
        &self,
        proxy: Proxy,
        spec: &ProxySpec,
        auth: &AuthContext,
        dispatcher: &SeatDispatcher,
    ) -> Result<Proxy, ProxyError> {
        let mut proxy = self.transition(proxy, ProxyStatus::Starting).await?;
        let mut startup_log = StartupLog::default();

        let clock = tokio::time::Instant::now();
        let (seat, delegate) = match dispatcher.acquire_seat(&proxy).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.rollback_start(&proxy, false).await;
                return Err(e);
            }
        };
        startup_log.container_start = Some(clock.elapsed());

        proxy.bind_to_delegate(&delegate.proxy);
        proxy.add_runtime_value(RuntimeValue::new(SEAT_ID_KEY, seat.id.to_string()));
        self.runtime_values
            .add_runtime_values_before_resolution(&mut proxy, spec, Some(auth));

        proxy.mark_up();
        let proxy = match self.store.update(proxy.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(release_err) = dispatcher.release_seat(&proxy).await {
                    tracing::warn!(
                        proxy_id = %proxy.id,
                        error = %release_err,
                        "Failed to release seat during rollback"
                    );
                }
                self.rollback_start(&proxy, false).await;
                return Err(ProxyError::store(e));
            }
        };

        if let Err(e) = self.mapping.register_proxy(&proxy) {
            if let Err(release_err) = dispatcher.release_seat(&proxy).await {
                tracing::warn!(
                    proxy_id = %proxy.id,
                    error = %release_err,
                    "Failed to release seat during rollback"
                );
            }
            self.rollback_start(&proxy, false).await;
            return Err(e);
        }

        tracing::info!(
            proxy_id = %proxy.id,
            delegate_proxy_id = %proxy.target_id,
            spec_id = %proxy.spec_id,
            "Proxy bound to warm seat"
        );
        self.events.publish(ProxyEventKind::ProxyStart {
            proxy_id: proxy.id.clone(),
            user_id: proxy.user_id.clone(),
            spec_id: proxy.spec_id.clone(),
            startup_log,
        });
        Ok(proxy)
    }

    /// Reserve a proxy stop. Routes are gone when this returns, before the
    /// command runs, so no new requests race the teardown.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NotFound`] for unknown ids, [`ProxyError::AccessDenied`]
    /// unless `ignore_access`, admin, or owner, [`ProxyError::IllegalState`]
    /// when the proxy is already stopping or stopped.
    #[instrument(skip(self, auth), fields(proxy_id = %proxy_id))]
    pub async fn stop_proxy(
        self: &Arc<Self>,
        auth: Option<&AuthContext>,
        proxy_id: &str,
        ignore_access: bool,
    ) -> Result<Command, ProxyError> {
        let proxy = self.fetch(proxy_id).await?;
        self.check_owner_gate(auth, &proxy, ignore_access, "stop")?;

        let proxy = self.transition(proxy, ProxyStatus::Stopping).await?;
        self.mapping.unregister_proxy(&proxy);

        let service = Arc::clone(self);
        Ok(Command::new(proxy.id.clone(), async move {
            service.run_stop(proxy).await
        }))
    }

    /// Deferred phase of a stop. Backend failures are logged and never
    /// block removal: the in-memory view converges even when the cluster
    /// is unreachable.
    async fn run_stop(&self, proxy: Proxy) -> Result<Proxy, ProxyError> {
        if proxy.is_delegating() {
            if let Some(dispatcher) = &self.dispatcher {
                if let Err(e) = dispatcher.release_seat(&proxy).await {
                    tracing::warn!(proxy_id = %proxy.id, error = %e, "Failed to release seat");
                }
            }
        } else if let Err(e) = self.backend.stop_proxy(&proxy).await {
            tracing::warn!(
                proxy_id = %proxy.id,
                error = %e,
                "Backend failed to stop proxy, removing the record anyway"
            );
        }

        let mut stopped = proxy.clone();
        stopped.status = ProxyStatus::Stopped;
        let stopped = match self.store.update(stopped).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(proxy_id = %proxy.id, error = %e, "Failed to record Stopped status");
                proxy
            }
        };

        self.events.publish(ProxyEventKind::ProxyStop {
            proxy_id: stopped.id.clone(),
            user_id: stopped.user_id.clone(),
            spec_id: stopped.spec_id.clone(),
            usage_duration: stopped.usage_duration(),
        });

        self.store
            .remove(&stopped.id)
            .await
            .map_err(ProxyError::store)?;

        tracing::info!(proxy_id = %stopped.id, "Proxy stopped");
        Ok(stopped)
    }

    /// Reserve a proxy pause. Routes are removed synchronously.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NotSupported`] when the backend cannot pause, plus the
    /// same gate and state errors as [`Self::stop_proxy`].
    #[instrument(skip(self, auth), fields(proxy_id = %proxy_id))]
    pub async fn pause_proxy(
        self: &Arc<Self>,
        auth: Option<&AuthContext>,
        proxy_id: &str,
        ignore_access: bool,
    ) -> Result<Command, ProxyError> {
        if !self.backend.supports_pause() {
            return Err(ProxyError::NotSupported {
                operation: "pause".to_owned(),
            });
        }

        let proxy = self.fetch(proxy_id).await?;
        self.check_owner_gate(auth, &proxy, ignore_access, "pause")?;

        let proxy = self.transition(proxy, ProxyStatus::Pausing).await?;
        self.mapping.unregister_proxy(&proxy);

        let service = Arc::clone(self);
        Ok(Command::new(proxy.id.clone(), async move {
            service.run_pause(proxy).await
        }))
    }

    /// Deferred phase of a pause
    async fn run_pause(&self, proxy: Proxy) -> Result<Proxy, ProxyError> {
        if let Err(e) = self.backend.pause_proxy(&proxy).await {
            tracing::error!(proxy_id = %proxy.id, error = %e, "Backend failed to pause proxy");
            // Put the proxy back in service rather than leaving it wedged
            let reverted = self.transition(proxy.clone(), ProxyStatus::Up).await;
            match reverted {
                Ok(reverted) => {
                    if let Err(register_err) = self.mapping.register_proxy(&reverted) {
                        tracing::error!(
                            proxy_id = %reverted.id,
                            error = %register_err,
                            "Failed to restore routes after pause failure"
                        );
                    }
                }
                Err(revert_err) => {
                    tracing::error!(
                        proxy_id = %proxy.id,
                        error = %revert_err,
                        "Failed to revert status after pause failure"
                    );
                }
            }
            return Err(ProxyError::BackendFailed {
                proxy_id: proxy.id.clone(),
                operation: "pause".to_owned(),
                source: e,
            });
        }

        let proxy = self.transition(proxy, ProxyStatus::Paused).await?;
        tracing::info!(proxy_id = %proxy.id, "Proxy paused");
        self.events.publish(ProxyEventKind::ProxyPause {
            proxy_id: proxy.id.clone(),
            user_id: proxy.user_id.clone(),
            spec_id: proxy.spec_id.clone(),
        });
        Ok(proxy)
    }

    /// Reserve a proxy resume. Parameters may change across a pause;
    /// they are re-validated here and the spec's expressions are
    /// re-evaluated in the deferred phase so environment values reflect
    /// the current context.
    ///
    /// # Errors
    ///
    /// Same as [`Self::pause_proxy`], plus [`ProxyError::InvalidParameters`].
    #[instrument(skip(self, auth, parameters), fields(proxy_id = %proxy_id))]
    pub async fn resume_proxy(
        self: &Arc<Self>,
        auth: Option<&AuthContext>,
        proxy_id: &str,
        parameters: Option<HashMap<String, String>>,
        ignore_access: bool,
    ) -> Result<Command, ProxyError> {
        if !self.backend.supports_pause() {
            return Err(ProxyError::NotSupported {
                operation: "resume".to_owned(),
            });
        }

        let mut proxy = self.fetch(proxy_id).await?;
        self.check_owner_gate(auth, &proxy, ignore_access, "resume")?;

        let spec = self
            .registry
            .get(&proxy.spec_id)
            .ok_or_else(|| ProxyError::NotFound {
                kind: "spec",
                id: proxy.spec_id.clone(),
            })?;

        process_parameters(&mut proxy, &spec, parameters.as_ref())?;
        let proxy = self.transition(proxy, ProxyStatus::Resuming).await?;

        let service = Arc::clone(self);
        let auth = auth.cloned();
        Ok(Command::new(proxy.id.clone(), async move {
            service.run_resume(proxy, &spec, auth.as_ref()).await
        }))
    }

    /// Deferred phase of a resume; failure paths mirror a failed start
    async fn run_resume(
        &self,
        mut proxy: Proxy,
        spec: &ProxySpec,
        auth: Option<&AuthContext>,
    ) -> Result<Proxy, ProxyError> {
        if let Err(e) = self.prepare_proxy_for_start(&mut proxy, spec, auth) {
            self.rollback_start(&proxy, true).await;
            return Err(e);
        }

        if let Err(e) = self.backend.resume_proxy(&proxy).await {
            self.rollback_start(&proxy, true).await;
            return Err(ProxyError::ContainerStartFailed {
                proxy_id: proxy.id.clone(),
                source: e,
            });
        }

        let responding = probe_until_ready(
            self.test_strategy.as_ref(),
            &proxy,
            self.config.probe_deadline(),
            self.config.probe_interval(),
        )
        .await;
        if !responding {
            self.rollback_start(&proxy, true).await;
            return Err(ProxyError::NotResponding {
                proxy_id: proxy.id.clone(),
            });
        }

        proxy.status = ProxyStatus::Up;
        let proxy = match self.store.update(proxy.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                self.rollback_start(&proxy, true).await;
                return Err(ProxyError::store(e));
            }
        };

        if let Err(e) = self.mapping.register_proxy(&proxy) {
            self.rollback_start(&proxy, true).await;
            return Err(e);
        }

        tracing::info!(proxy_id = %proxy.id, "Proxy resumed");
        self.events.publish(ProxyEventKind::ProxyResume {
            proxy_id: proxy.id.clone(),
            user_id: proxy.user_id.clone(),
            spec_id: proxy.spec_id.clone(),
        });
        Ok(proxy)
    }

    /// Insert a proxy observed in the backend during recovery: the record
    /// and routes come back, no start event is published.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Store`] when the record cannot be inserted,
    /// [`ProxyError::RouteConflict`] when its routes are already live.
    #[instrument(skip(self, proxy), fields(proxy_id = %proxy.id))]
    pub async fn add_existing_proxy(&self, proxy: Proxy) -> Result<(), ProxyError> {
        self.store
            .add(proxy.clone())
            .await
            .map_err(ProxyError::store)?;
        if let Err(e) = self.mapping.register_proxy(&proxy) {
            let _ = self.store.remove(&proxy.id).await;
            return Err(e);
        }
        tracing::info!(proxy_id = %proxy.id, "Recovered existing proxy");
        Ok(())
    }

    /// Stop all proxies best-effort when configured to; otherwise leak
    /// them to the backend so a restarted instance can recover them.
    pub async fn shutdown(&self) {
        if !self.config.stop_proxies_on_shutdown {
            tracing::info!("Leaving proxies running for recovery after restart");
            return;
        }

        let proxies = match self.store.list().await {
            Ok(proxies) => proxies,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list proxies during shutdown");
                return;
            }
        };

        tracing::info!(count = proxies.len(), "Stopping all proxies on shutdown");
        for proxy in proxies {
            self.mapping.unregister_proxy(&proxy);
            if proxy.is_delegating() {
                continue;
            }
            if let Err(e) = self.backend.stop_proxy(&proxy).await {
                tracing::warn!(proxy_id = %proxy.id, error = %e, "Failed to stop proxy on shutdown");
            }
        }
    }

    /// Inject runtime values and resolve the spec for a (re)start.
    ///
    /// The pre-resolution phase populates values the spec's expressions
    /// reference; the post-resolution phase populates values computed from
    /// expression results.
    fn prepare_proxy_for_start(
        &self,
        proxy: &mut Proxy,
        spec: &ProxySpec,
        auth: Option<&AuthContext>,
    ) -> Result<ProxySpec, ProxyError> {
        self.runtime_values
            .add_runtime_values_before_resolution(proxy, spec, auth);
        self.backend.add_runtime_values_before_resolution(proxy);

        let ctx = ResolutionContext::build(proxy, spec, auth);
        let resolved = spec.resolve(&self.resolver, &ctx)?;

        self.runtime_values
            .add_runtime_values_after_resolution(proxy, &resolved);
        Ok(resolved)
    }

    /// Undo a failed start or resume: optionally stop the container group,
    /// drop the record, publish the failure event. Each step best-effort.
    async fn rollback_start(&self, proxy: &Proxy, stop_container: bool) {
        if stop_container && !proxy.is_delegating() {
            if let Err(e) = self.backend.stop_proxy(proxy).await {
                tracing::warn!(proxy_id = %proxy.id, error = %e, "Rollback failed to stop container");
            }
        }

        if let Err(e) = self.store.remove(&proxy.id).await {
            tracing::error!(proxy_id = %proxy.id, error = %e, "Rollback failed to remove record");
        }
        self.mapping.unregister_proxy(proxy);

        self.events.publish(ProxyEventKind::ProxyStartFailed {
            proxy_id: Some(proxy.id.clone()),
            user_id: proxy.user_id.clone(),
            spec_id: proxy.spec_id.clone(),
        });
    }

    /// Move a proxy to `next` through the store, enforcing the state machine
    async fn transition(&self, mut proxy: Proxy, next: ProxyStatus) -> Result<Proxy, ProxyError> {
        if !proxy.status.can_transition(next) {
            return Err(ProxyError::IllegalState {
                subject: proxy.id.clone(),
                operation: format!("transition to {next}"),
                state: proxy.status.to_string(),
            });
        }
        proxy.status = next;
        self.store.update(proxy).await.map_err(ProxyError::store)
    }

    async fn fetch(&self, proxy_id: &str) -> Result<Proxy, ProxyError> {
        self.store
            .get(proxy_id)
            .await
            .map_err(ProxyError::store)?
            .ok_or_else(|| ProxyError::NotFound {
                kind: "proxy",
                id: proxy_id.to_owned(),
            })
    }

    /// ignore_access ∨ admin ∨ owner
    fn check_owner_gate(
        &self,
        auth: Option<&AuthContext>,
        proxy: &Proxy,
        ignore_access: bool,
        operation: &str,
    ) -> Result<(), ProxyError> {
        if ignore_access {
            return Ok(());
        }
        if let Some(auth) = auth {
            if auth.admin || proxy.user_id.as_deref() == Some(auth.user_id.as_str()) {
                return Ok(());
            }
        }
        tracing::warn!(
            proxy_id = %proxy.id,
            operation = %operation,
            "Denied lifecycle operation"
        );
        Err(ProxyError::AccessDenied {
            user: auth.map_or_else(|| "anonymous".to_owned(), |a| a.user_id.clone()),
            spec_id: proxy.spec_id.clone(),
        })
    }
}

/// Validate caller-supplied parameters against the spec schema and record
/// the chosen values as env-visible runtime values. Omitted parameters take
/// the first allowed value.
fn process_parameters(
    proxy: &mut Proxy,
    spec: &ProxySpec,
    provided: Option<&HashMap<String, String>>,
) -> Result<(), ProxyError> {
    if let Some(provided) = provided {
        for key in provided.keys() {
            if !spec.parameters.iter().any(|p| &p.id == key) {
                return Err(ProxyError::InvalidParameters {
                    spec_id: spec.id.clone(),
                    reason: format!("unknown parameter '{key}'"),
                });
            }
        }
    }

    for parameter in &spec.parameters {
        let value = match provided.and_then(|p| p.get(&parameter.id)) {
            Some(value) => {
                if !parameter.values.contains(value) {
                    return Err(ProxyError::InvalidParameters {
                        spec_id: spec.id.clone(),
                        reason: format!(
                            "value '{}' is not allowed for parameter '{}'",
                            value, parameter.id
                        ),
                    });
                }
                value.clone()
            }
            None => parameter
                .values
                .first()
                .cloned()
                .ok_or_else(|| ProxyError::InvalidParameters {
                    spec_id: spec.id.clone(),
                    reason: format!("parameter '{}' has no allowed values", parameter.id),
                })?,
        };

        proxy.add_runtime_value(RuntimeValue::custom(
            format!("parameter.{}", parameter.id),
            Some(format!(
                "PORTICO_PARAM_{}",
                parameter.id.to_uppercase().replace('-', "_")
            )),
            value,
            true,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spec::ParameterSpec;

    fn spec_with_parameter() -> ProxySpec {
        ProxySpec {
            id: "s1".to_owned(),
            parameters: vec![ParameterSpec {
                id: "memory".to_owned(),
                display_name: None,
                values: vec!["2g".to_owned(), "8g".to_owned()],
            }],
            ..ProxySpec::default()
        }
    }

    fn proxy() -> Proxy {
        Proxy::new(ProxyInit {
            id: "p-1".to_owned(),
            spec_id: "s1".to_owned(),
            user_id: Some("alice".to_owned()),
            display_name: "s1".to_owned(),
        })
    }

    #[test]
    fn test_parameters_default_to_first_value() {
        let mut p = proxy();
        process_parameters(&mut p, &spec_with_parameter(), None).unwrap();
        assert_eq!(
            p.runtime_value("parameter.memory").unwrap().value_as_string(),
            "2g"
        );
    }

    #[test]
    fn test_parameters_accept_allowed_override() {
        let mut p = proxy();
        let provided: HashMap<String, String> =
            [("memory".to_owned(), "8g".to_owned())].into();
        process_parameters(&mut p, &spec_with_parameter(), Some(&provided)).unwrap();

        let value = p.runtime_value("parameter.memory").unwrap();
        assert_eq!(value.value_as_string(), "8g");
        assert_eq!(value.env_name.as_deref(), Some("PORTICO_PARAM_MEMORY"));
        assert!(value.include_as_env);
    }

    #[test]
    fn test_parameters_reject_disallowed_value() {
        let mut p = proxy();
        let provided: HashMap<String, String> =
            [("memory".to_owned(), "512t".to_owned())].into();
        let err =
            process_parameters(&mut p, &spec_with_parameter(), Some(&provided)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidParameters { .. }));
    }

    #[test]
    fn test_parameters_reject_unknown_key() {
        let mut p = proxy();
        let provided: HashMap<String, String> =
            [("gpu".to_owned(), "1".to_owned())].into();
        let err =
            process_parameters(&mut p, &spec_with_parameter(), Some(&provided)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidParameters { .. }));
    }
}
