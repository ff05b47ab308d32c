//! Kernel configuration types.
//!
//! Loaded from TOML by `svclink_kernel::config::load_config`. Every field has
//! a default so partial files are accepted.

use serde::{Deserialize, Serialize};

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tracing filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Service manager settings.
    pub manager: ManagerConfig,
    /// Router link settings.
    pub router: RouterConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            manager: ManagerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

/// Service manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long shutdown waits for the request queue to drain.
    /// `0` waits without bound.
    pub shutdown_timeout_ms: u64,
    /// Queue depth above which a warning is logged.
    pub queue_warn_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
            queue_warn_depth: 1_024,
        }
    }
}

/// Router link settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Whether public services are announced to a router.
    pub enabled: bool,
    /// Address of the router process, interpreted by the transport.
    pub connect_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.manager.shutdown_timeout_ms, 5_000);
        assert!(!config.router.enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: KernelConfig = toml::from_str(
            r#"
            log_level = "debug"

            [router]
            enabled = true
            connect_address = "127.0.0.1:8181"
        "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.router.enabled);
        assert_eq!(config.router.connect_address.as_deref(), Some("127.0.0.1:8181"));
        assert_eq!(config.manager.queue_warn_depth, 1_024);
    }
}
