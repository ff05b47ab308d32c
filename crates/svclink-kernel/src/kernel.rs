//! SvcLinkKernel: assembles the dispatcher registry, the service manager and
//! the optional router link.

use crate::bridge::{QueuedRouterClient, RouterClient, RouterLink};
use crate::config::load_config;
use crate::dispatcher::ThreadRegistry;
use crate::error::{KernelError, KernelResult};
use crate::logging::init_tracing;
use crate::manager::ServiceManager;
use bytes::Bytes;
use std::path::Path;
use std::sync::{Arc, Mutex};
use svclink_types::config::KernelConfig;
use tokio::sync::mpsc;
use tracing::info;

/// The svclink kernel.
pub struct SvcLinkKernel {
    /// Kernel configuration.
    pub config: KernelConfig,
    /// Live dispatcher threads.
    pub threads: Arc<ThreadRegistry>,
    /// The service manager actor.
    pub manager: Arc<ServiceManager>,
    /// Router client, when the router link is enabled.
    router: Option<Arc<QueuedRouterClient>>,
    /// Encoded messages for the router transport to send.
    router_outbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl SvcLinkKernel {
    /// Load the configuration, install the tracing subscriber and boot.
    pub fn boot(config_path: Option<&Path>) -> KernelResult<Self> {
        let config = load_config(config_path);
        init_tracing(&config);
        Self::boot_with_config(config)
    }

    /// Boot with an explicit configuration. Must be called within a tokio
    /// runtime.
    pub fn boot_with_config(config: KernelConfig) -> KernelResult<Self> {
        let threads = Arc::new(ThreadRegistry::new());
        let manager = Arc::new(ServiceManager::new(threads.clone(), config.manager.clone()));

        let (router, router_outbound) = if config.router.enabled {
            let (client, outbound) = QueuedRouterClient::new();
            let client = Arc::new(client);
            manager.set_router_client(Some(client.clone() as Arc<dyn RouterClient>));
            info!(
                address = config.router.connect_address.as_deref().unwrap_or("<unset>"),
                "Router link enabled"
            );
            (Some(client), Some(outbound))
        } else {
            (None, None)
        };

        manager
            .start()
            .map_err(KernelError::ManagerStart)?;

        info!(
            router = config.router.enabled,
            shutdown_timeout_ms = config.manager.shutdown_timeout_ms,
            "SvcLink kernel booted"
        );

        Ok(Self {
            config,
            threads,
            manager,
            router,
            router_outbound: Mutex::new(router_outbound),
        })
    }

    /// The router client, when the router link is enabled.
    pub fn router_client(&self) -> Option<&Arc<QueuedRouterClient>> {
        self.router.as_ref()
    }

    /// Take the queue of encoded router messages. Returns `None` after the
    /// first call or when the router link is disabled.
    pub fn take_router_outbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.router_outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Inbound handler for messages received from the router.
    pub fn router_link(&self) -> RouterLink {
        RouterLink::new(self.manager.clone())
    }

    /// Stop the service manager, draining queued requests.
    pub async fn shutdown(&self) -> KernelResult<()> {
        info!("Shutting down SvcLink kernel");
        if let Some(router) = &self.router {
            router.set_connected(false);
        }
        self.manager.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_boot_and_shutdown() {
        let kernel = SvcLinkKernel::boot_with_config(KernelConfig::default()).unwrap();
        assert!(kernel.manager.is_running());
        assert!(kernel.router_client().is_none());
        assert!(kernel.take_router_outbound().is_none());
        kernel.shutdown().await.unwrap();
        assert!(!kernel.manager.is_running());
        assert!(kernel.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_router_enabled() {
        let mut config = KernelConfig::default();
        config.router.enabled = true;
        let kernel = SvcLinkKernel::boot_with_config(config).unwrap();
        assert!(kernel.router_client().is_some());
        assert!(kernel.take_router_outbound().is_some());
        assert!(kernel.take_router_outbound().is_none());
        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_boot_from_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = SvcLinkKernel::boot(Some(&dir.path().join("config.toml"))).unwrap();
        assert_eq!(kernel.config.log_level, "info");
        kernel.shutdown().await.unwrap();
    }
}
