//! Proxy base for svclink.
//!
//! A proxy is the consumer-side endpoint of a service. This crate keeps the
//! per-proxy state generated interfaces build on:
//!
//! - the listener table correlating outstanding requests and attribute or
//!   broadcast subscriptions with the local consumer awaiting them,
//! - the notification protocol (start/stop upstream, attribute cache),
//! - shared [`ProxyHandle`]s and the [`ProxyRegistry`] that routes a thread's
//!   inbound events to the addressed proxy.

pub mod consumer;
pub mod interface;
pub mod listener;
pub mod proxy;
pub mod registry;

pub use consumer::{ConsumerError, ConsumerId, ProxyConsumer, ProxyResponse};
pub use interface::{InterfaceTable, MessageKind};
pub use listener::{Listener, ListenerList};
pub use proxy::Proxy;
pub use registry::{ProxyHandle, ProxyRegistry};
