//! Core types for the svclink service substrate.
//!
//! This crate defines the value types shared by the kernel, the proxy layer
//! and the wire codec: service identity, addresses, channels, connection
//! states and the events exchanged between components. It contains no
//! business logic beyond identity and compatibility rules.

pub mod address;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod service;
pub mod state;

pub use address::{AddressError, ProxyAddress, ServiceAddress, StubAddress, CHECKSUM_IGNORE};
pub use channel::{Channel, Cookie, ThreadId};
pub use event::ServiceEvent;
pub use message::{MessageId, NotifyRequest, ResultType, SequenceNumber};
pub use service::{ServiceItem, ServiceType, Version};
pub use state::{ConnectionState, DisconnectReason};
