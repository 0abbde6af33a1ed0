use async_trait::async_trait;
use std::time::Duration;

use super::traits::TestStrategy;
use crate::core::proxy::Proxy;

/// Readiness probe that opens a TCP connection to every target of the
/// proxy. A proxy with no targets is considered ready.
#[derive(Debug, Clone)]
pub struct TcpTestStrategy {
    connect_timeout: Duration,
}

impl TcpTestStrategy {
    /// Create a probe with the given per-connection timeout
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTestStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl TestStrategy for TcpTestStrategy {
    async fn test_proxy(&self, proxy: &Proxy) -> bool {
        for (route, target) in &proxy.targets {
            let Some(addr) = authority_of(target) else {
                tracing::warn!(
                    proxy_id = %proxy.id,
                    route = %route,
                    target = %target,
                    "Target URI has no host, failing probe"
                );
                return false;
            };

            let connect = tokio::net::TcpStream::connect(&addr);
            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(_stream)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(
                        proxy_id = %proxy.id,
                        addr = %addr,
                        error = %e,
                        "Probe connection refused"
                    );
                    return false;
                }
                Err(_) => {
                    tracing::debug!(
                        proxy_id = %proxy.id,
                        addr = %addr,
                        "Probe connection timed out"
                    );
                    return false;
                }
            }
        }
        true
    }
}

/// Extract `host:port` from a target URI, defaulting the port by scheme
fn authority_of(target: &str) -> Option<String> {
    let uri: http::Uri = target.parse().ok()?;
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    });
    Some(format!("{host}:{port}"))
}
