use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Default public path under which proxy routes are exposed
pub const DEFAULT_PUBLIC_PATH_PREFIX: &str = "/api/route/";

/// Core configuration for the lifecycle engine and pool scalers.
/// Loaded at startup and not reloaded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Stop all proxies on shutdown; when false they are leaked to the
    /// backend so a restarted instance can recover them
    pub stop_proxies_on_shutdown: bool,

    /// Public path prefix for proxy routes
    pub public_path_prefix: String,

    /// Readiness probe budget in seconds
    pub probe_deadline_secs: u64,

    /// Delay between readiness probe attempts in seconds
    pub probe_interval_secs: u64,

    /// How long a delegating proxy waits for a seat before failing, in seconds
    pub seat_wait_timeout_secs: u64,

    /// Periodic reconcile tick for pool scalers, in seconds
    pub reconcile_interval_secs: u64,

    /// Remove surplus seats above `maximum_seats_available`.
    /// Off by default; when off the surplus is only logged.
    pub enable_seat_scale_down: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stop_proxies_on_shutdown: true,
            public_path_prefix: DEFAULT_PUBLIC_PATH_PREFIX.to_owned(),
            probe_deadline_secs: 60,
            probe_interval_secs: 2,
            seat_wait_timeout_secs: 300,
            reconcile_interval_secs: 10,
            enable_seat_scale_down: false,
        }
    }
}

/// Shape of `~/.portico/config.toml`
#[derive(Debug, Deserialize)]
struct ConfigFile {
    proxy: Option<ProxyConfig>,
}

impl ProxyConfig {
    /// Load configuration with priority: env vars → TOML file → defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML config file exists but cannot be parsed.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::load_from_toml()? {
            config = file_config;
        }

        config.apply_env();
        Ok(config)
    }

    /// Load from the TOML config file, if present
    fn load_from_toml() -> anyhow::Result<Option<Self>> {
        let Some(config_path) = config_path() else {
            return Ok(None);
        };
        Self::load_file(&config_path)
    }

    /// Load from a specific TOML file, if present
    fn load_file(config_path: &std::path::Path) -> anyhow::Result<Option<Self>> {
        if !config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

        let file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", config_path.display()))?;

        Ok(file.proxy)
    }

    /// Override fields from `PORTICO_*` environment variables
    fn apply_env(&mut self) {
        if let Some(v) = parse_env_bool("PORTICO_STOP_PROXIES_ON_SHUTDOWN") {
            self.stop_proxies_on_shutdown = v;
        }
        if let Ok(v) = std::env::var("PORTICO_PUBLIC_PATH_PREFIX")
            && !v.is_empty()
        {
            self.public_path_prefix = v;
        }
        if let Some(v) = parse_env_u64("PORTICO_PROBE_DEADLINE_SECS") {
            self.probe_deadline_secs = v;
        }
        if let Some(v) = parse_env_u64("PORTICO_PROBE_INTERVAL_SECS") {
            self.probe_interval_secs = v;
        }
        if let Some(v) = parse_env_u64("PORTICO_SEAT_WAIT_TIMEOUT_SECS") {
            self.seat_wait_timeout_secs = v;
        }
        if let Some(v) = parse_env_u64("PORTICO_RECONCILE_INTERVAL_SECS") {
            self.reconcile_interval_secs = v;
        }
        if let Some(v) = parse_env_bool("PORTICO_ENABLE_SEAT_SCALE_DOWN") {
            self.enable_seat_scale_down = v;
        }
    }

    /// Readiness probe budget
    #[must_use]
    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }

    /// Delay between probe attempts
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Seat wait deadline for delegating proxies
    #[must_use]
    pub fn seat_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.seat_wait_timeout_secs)
    }

    /// Periodic reconcile tick
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Path of the TOML config file (`~/.portico/config.toml`)
fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".portico").join("config.toml"))
}

fn parse_env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

static PUBLIC_PATH_PREFIX: OnceLock<String> = OnceLock::new();

/// Set the process-wide public path prefix. Call once during startup,
/// before any proxy is started; later calls are ignored with a warning.
pub fn set_public_path_prefix(prefix: impl Into<String>) {
    let prefix = prefix.into();
    if PUBLIC_PATH_PREFIX.set(prefix.clone()).is_err() {
        tracing::warn!(prefix = %prefix, "Public path prefix already initialized, ignoring");
    }
}

/// The process-wide public path prefix
#[must_use]
pub fn public_path_prefix() -> &'static str {
    PUBLIC_PATH_PREFIX
        .get()
        .map_or(DEFAULT_PUBLIC_PATH_PREFIX, String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert!(config.stop_proxies_on_shutdown);
        assert_eq!(config.public_path_prefix, DEFAULT_PUBLIC_PATH_PREFIX);
        assert_eq!(config.probe_deadline(), Duration::from_secs(60));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(10));
        assert!(!config.enable_seat_scale_down);
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            [proxy]
            stop_proxies_on_shutdown = false
            probe_deadline_secs = 15
            enable_seat_scale_down = true
        "#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = file.proxy.unwrap();
        assert!(!config.stop_proxies_on_shutdown);
        assert_eq!(config.probe_deadline_secs, 15);
        assert!(config.enable_seat_scale_down);
        // Unset fields fall back to defaults
        assert_eq!(config.reconcile_interval_secs, 10);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[proxy]\npublic_path_prefix = \"/proxy/\"\nseat_wait_timeout_secs = 30\n",
        )
        .unwrap();

        let config = ProxyConfig::load_file(&path).unwrap().unwrap();
        assert_eq!(config.public_path_prefix, "/proxy/");
        assert_eq!(config.seat_wait_timeout(), Duration::from_secs(30));

        // Absent file is not an error
        assert!(
            ProxyConfig::load_file(&dir.path().join("missing.toml"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_load_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not toml at all [").unwrap();
        assert!(ProxyConfig::load_file(&path).is_err());
    }

    #[test]
    fn test_public_path_prefix_default() {
        assert!(public_path_prefix().starts_with('/'));
    }
}
