//! Core kernel for svclink.
//!
//! The kernel owns the dispatcher-thread registry, the server/client
//! registry and the service manager that brokers connections between stubs
//! and proxies, locally and through a router.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod manager;
pub mod registry;

pub use bridge::{QueuedRouterClient, RemoteServiceProvider, RouterClient, RouterLink, ServiceConnector};
pub use dispatcher::{DispatcherThread, EventReceiver, EventThread, ThreadRegistry};
pub use kernel::SvcLinkKernel;
pub use manager::ServiceManager;
