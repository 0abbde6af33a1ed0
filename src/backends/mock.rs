//! Mock implementations of backend traits for testing.
//!
//! These mocks track container state in memory without talking to a real
//! cluster, following the same start contract as production backends.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use super::traits::{ContainerBackend, StartError, TestStrategy};
use crate::core::proxy::{Container, Proxy};
use crate::core::spec::ProxySpec;

/// Mock container backend tracking started proxies in memory.
pub struct MockContainerBackend {
    /// Proxies whose containers are "running", keyed by proxy id
    started: RwLock<HashMap<String, Proxy>>,

    /// Proxy ids passed to `stop_proxy`, in call order
    stop_calls: RwLock<Vec<String>>,

    /// If true, `start_proxy` fails
    should_fail: AtomicBool,

    /// If true, failures carry a partial proxy with one container
    fail_with_partial: AtomicBool,

    /// Whether pause/resume are supported
    supports_pause: AtomicBool,

    /// Error message returned on simulated failure
    error_message: RwLock<String>,
}

impl std::fmt::Debug for MockContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockContainerBackend").finish_non_exhaustive()
    }
}

impl MockContainerBackend {
    /// Create a mock backend with pause support enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: RwLock::new(HashMap::new()),
            stop_calls: RwLock::new(Vec::new()),
            should_fail: AtomicBool::new(false),
            fail_with_partial: AtomicBool::new(false),
            supports_pause: AtomicBool::new(true),
            error_message: RwLock::new("Mock failure".to_owned()),
        }
    }

    /// Configure start to fail
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    /// Configure failures to carry a partial proxy
    pub fn set_fail_with_partial(&self, partial: bool) {
        self.fail_with_partial.store(partial, Ordering::SeqCst);
    }

    /// Configure pause support
    pub fn set_supports_pause(&self, supported: bool) {
        self.supports_pause.store(supported, Ordering::SeqCst);
    }

    /// Set the error message for simulated failures
    pub async fn set_error_message(&self, message: impl Into<String>) {
        *self.error_message.write().await = message.into();
    }

    /// Proxy ids whose containers are currently running
    pub async fn running(&self) -> Vec<String> {
        self.started.read().await.keys().cloned().collect()
    }

    /// Whether a proxy's containers are running
    pub async fn is_running(&self, proxy_id: &str) -> bool {
        self.started.read().await.contains_key(proxy_id)
    }

    /// Proxy ids passed to `stop_proxy`, in call order
    pub async fn stop_calls(&self) -> Vec<String> {
        self.stop_calls.read().await.clone()
    }

    fn should_fail(&self) -> bool {
        self.should_fail.load(Ordering::SeqCst)
    }
}

impl Default for MockContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for MockContainerBackend {
    async fn start_proxy(&self, proxy: &Proxy, spec: &ProxySpec) -> Result<Proxy, StartError> {
        if self.should_fail() {
            let msg = self.error_message.read().await.clone();
            if self.fail_with_partial.load(Ordering::SeqCst) {
                let mut partial = proxy.clone();
                let mut container = Container::new(0);
                container.id = Some(format!("mock-{}-0", proxy.id));
                partial.containers.push(container);
                return Err(StartError::partial(partial, anyhow::anyhow!("{msg}")));
            }
            return Err(StartError::clean(anyhow::anyhow!("{msg}")));
        }

        let mut started = proxy.clone();
        for (index, container_spec) in spec.container_specs.iter().enumerate() {
            let mut container = Container::new(index);
            container.id = Some(format!("mock-{}-{}", proxy.id, index));
            for mapping in &container_spec.port_mappings {
                let uri = format!("http://127.0.0.1:{}", mapping.port);
                container.targets.insert(mapping.name.clone(), uri.clone());
                started
                    .targets
                    .insert(format!("{}/{}", proxy.id, mapping.name), uri);
            }
            started.containers.push(container);
        }

        self.started
            .write()
            .await
            .insert(started.id.clone(), started.clone());
        Ok(started)
    }

    async fn stop_proxy(&self, proxy: &Proxy) -> anyhow::Result<()> {
        self.stop_calls.write().await.push(proxy.id.clone());
        if self.should_fail() {
            let msg = self.error_message.read().await.clone();
            anyhow::bail!("{msg}");
        }
        self.started.write().await.remove(&proxy.id);
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        self.supports_pause.load(Ordering::SeqCst)
    }

    async fn pause_proxy(&self, _proxy: &Proxy) -> anyhow::Result<()> {
        if self.should_fail() {
            let msg = self.error_message.read().await.clone();
            anyhow::bail!("{msg}");
        }
        Ok(())
    }

    async fn resume_proxy(&self, _proxy: &Proxy) -> anyhow::Result<()> {
        if self.should_fail() {
            let msg = self.error_message.read().await.clone();
            anyhow::bail!("{msg}");
        }
        Ok(())
    }
}

/// Mock readiness probe with scripted results.
///
/// Results are consumed front to back; when the script is empty the
/// default result applies.
pub struct MockTestStrategy {
    script: Mutex<VecDeque<bool>>,
    default_result: AtomicBool,
    attempts: std::sync::atomic::AtomicUsize,
}

impl std::fmt::Debug for MockTestStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTestStrategy").finish_non_exhaustive()
    }
}

impl MockTestStrategy {
    /// A probe that always succeeds
    #[must_use]
    pub fn always_up() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_result: AtomicBool::new(true),
            attempts: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A probe that always fails
    #[must_use]
    pub fn always_down() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_result: AtomicBool::new(false),
            attempts: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Script the next results, front to back
    pub async fn script_results(&self, results: impl IntoIterator<Item = bool>) {
        self.script.lock().await.extend(results);
    }

    /// How many probe attempts were made
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestStrategy for MockTestStrategy {
    async fn test_proxy(&self, _proxy: &Proxy) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(result) => result,
            None => self.default_result.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::ProxyInit;
    use crate::core::spec::{ContainerSpec, PortMapping};

    fn proxy(id: &str) -> Proxy {
        Proxy::new(ProxyInit {
            id: id.to_owned(),
            spec_id: "s1".to_owned(),
            user_id: Some("alice".to_owned()),
            display_name: "s1".to_owned(),
        })
    }

    fn spec() -> ProxySpec {
        ProxySpec {
            id: "s1".to_owned(),
            container_specs: vec![ContainerSpec {
                image: "registry/app:latest".to_owned(),
                port_mappings: vec![PortMapping {
                    name: "default".to_owned(),
                    port: 3838,
                }],
                ..ContainerSpec::default()
            }],
            ..ProxySpec::default()
        }
    }

    #[tokio::test]
    async fn test_start_fills_containers_and_targets() {
        let backend = MockContainerBackend::new();
        let started = backend.start_proxy(&proxy("p-1"), &spec()).await.unwrap();

        assert_eq!(started.containers.len(), 1);
        assert!(started.containers[0].id.as_deref().unwrap().contains("p-1"));
        assert_eq!(
            started.targets.get("p-1/default").map(String::as_str),
            Some("http://127.0.0.1:3838")
        );
        assert!(backend.is_running("p-1").await);
    }

    #[tokio::test]
    async fn test_start_failure_with_partial_state() {
        let backend = MockContainerBackend::new();
        backend.set_should_fail(true);
        backend.set_fail_with_partial(true);
        backend.set_error_message("image pull failed").await;

        let err = backend.start_proxy(&proxy("p-2"), &spec()).await.unwrap_err();
        assert!(err.partial_proxy.is_some());
        assert!(err.source.to_string().contains("image pull failed"));
    }

    #[tokio::test]
    async fn test_stop_records_call() {
        let backend = MockContainerBackend::new();
        let started = backend.start_proxy(&proxy("p-3"), &spec()).await.unwrap();

        backend.stop_proxy(&started).await.unwrap();
        assert!(!backend.is_running("p-3").await);
        assert_eq!(backend.stop_calls().await, vec!["p-3".to_owned()]);
    }

    #[tokio::test]
    async fn test_scripted_probe() {
        let probe = MockTestStrategy::always_up();
        probe.script_results([false, true]).await;
        let p = proxy("p-4");

        assert!(!probe.test_proxy(&p).await);
        assert!(probe.test_proxy(&p).await);
        // Script exhausted, default applies
        assert!(probe.test_proxy(&p).await);
        assert_eq!(probe.attempts(), 3);
    }
}
