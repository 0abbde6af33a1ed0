use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::proxy::Proxy;
use crate::core::spec::ProxySpec;

/// Failure of a container start, carrying whatever partial state the
/// backend managed to create so the caller can clean it up.
#[derive(Debug, Error)]
#[error("container start failed: {source}")]
pub struct StartError {
    /// Partially started proxy to tear down, when the backend got far
    /// enough to create anything
    pub partial_proxy: Option<Proxy>,

    /// The underlying backend error
    #[source]
    pub source: anyhow::Error,
}

impl StartError {
    /// A failure with nothing to clean up
    #[must_use]
    pub fn clean(source: anyhow::Error) -> Self {
        Self {
            partial_proxy: None,
            source,
        }
    }

    /// A failure that left partial container state behind
    #[must_use]
    pub fn partial(proxy: Proxy, source: anyhow::Error) -> Self {
        Self {
            partial_proxy: Some(proxy),
            source,
        }
    }
}

/// Trait for container backends (Kubernetes, Docker, etc.)
///
/// The start contract is all-or-nothing from the caller's perspective:
/// either a proxy whose containers carry backend ids and targets comes
/// back, or a [`StartError`] carries the partial state to clean up.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Start the container group for a proxy from its resolved spec.
    ///
    /// Returns the proxy with containers filled in (backend ids, targets).
    async fn start_proxy(&self, proxy: &Proxy, spec: &ProxySpec) -> Result<Proxy, StartError>;

    /// Stop the container group
    async fn stop_proxy(&self, proxy: &Proxy) -> anyhow::Result<()>;

    /// Static capability flag for pause/resume support
    fn supports_pause(&self) -> bool;

    /// Suspend the container group
    async fn pause_proxy(&self, proxy: &Proxy) -> anyhow::Result<()>;

    /// Resume a suspended container group
    async fn resume_proxy(&self, proxy: &Proxy) -> anyhow::Result<()>;

    /// Contribute backend-specific runtime values before spec resolution
    /// (e.g. naming patterns expressions can reference). Default: none.
    fn add_runtime_values_before_resolution(&self, _proxy: &mut Proxy) {}
}

/// Readiness probe for a started proxy. A single attempt; callers own the
/// retry budget.
#[async_trait]
pub trait TestStrategy: Send + Sync {
    /// Whether the proxy currently answers
    async fn test_proxy(&self, proxy: &Proxy) -> bool;
}

/// Probe a proxy until it answers or the deadline expires.
///
/// Returns false on expiry. Proxies in an unavailable status must not be
/// probed; callers check status before entering the loop.
pub async fn probe_until_ready(
    strategy: &dyn TestStrategy,
    proxy: &Proxy,
    deadline: Duration,
    interval: Duration,
) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if strategy.test_proxy(proxy).await {
            return true;
        }
        if started.elapsed() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::ProxyInit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStrategy {
        attempts: AtomicUsize,
        succeed_on: usize,
    }

    #[async_trait]
    impl TestStrategy for CountingStrategy {
        async fn test_proxy(&self, _proxy: &Proxy) -> bool {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            n >= self.succeed_on
        }
    }

    fn proxy() -> Proxy {
        Proxy::new(ProxyInit {
            id: "p-1".to_owned(),
            spec_id: "s1".to_owned(),
            user_id: None,
            display_name: "s1".to_owned(),
        })
    }

    #[tokio::test]
    async fn test_probe_retries_until_success() {
        let strategy = CountingStrategy {
            attempts: AtomicUsize::new(0),
            succeed_on: 3,
        };
        let ok = probe_until_ready(
            &strategy,
            &proxy(),
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await;
        assert!(ok);
        assert_eq!(strategy.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_deadline_expires() {
        let strategy = CountingStrategy {
            attempts: AtomicUsize::new(0),
            succeed_on: usize::MAX,
        };
        let ok = probe_until_ready(
            &strategy,
            &proxy(),
            Duration::from_millis(10),
            Duration::from_millis(4),
        )
        .await;
        assert!(!ok);
    }
}
