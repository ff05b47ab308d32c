//! Seams between the service manager, the router transport and proxies.
//!
//! - [`RouterClient`] is implemented by the transport and consumed by the
//!   manager to announce local public services and relay events.
//! - [`RemoteServiceProvider`] is implemented by the manager and driven by
//!   the transport when peers announce or withdraw services.
//! - [`ServiceConnector`] is what a proxy needs from the kernel.
//!
//! [`QueuedRouterClient`] and [`RouterLink`] connect both directions to a
//! byte queue using the svclink wire format; framing and sockets are left to
//! the transport.

use crate::manager::ServiceManager;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use svclink_types::event::ServiceEvent;
use svclink_types::{
    Channel, Cookie, DisconnectReason, ProxyAddress, StubAddress, ThreadId,
};
use svclink_wire::{decode_message, encode_message, RouterMessage, WireError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound side of the router link.
pub trait RouterClient: Send + Sync {
    fn is_connected(&self) -> bool;

    fn register_stub(&self, stub: &StubAddress) -> bool;

    fn unregister_stub(&self, stub: &StubAddress, reason: DisconnectReason) -> bool;

    fn register_proxy(&self, proxy: &ProxyAddress) -> bool;

    fn unregister_proxy(&self, proxy: &ProxyAddress, reason: DisconnectReason) -> bool;

    /// Forward an event whose destination lives in another process.
    fn relay_event(&self, event: ServiceEvent) -> bool;
}

/// Inbound side of the router link.
pub trait RemoteServiceProvider: Send + Sync {
    /// Services whose channel cookie falls in `cookie` (`ANY` for all).
    fn service_list(&self, cookie: Cookie) -> (Vec<StubAddress>, Vec<ProxyAddress>);

    fn register_remote_stub(&self, stub: StubAddress);

    fn register_remote_proxy(&self, proxy: ProxyAddress);

    fn unregister_remote_stub(&self, stub: StubAddress, reason: DisconnectReason, cookie: Cookie);

    fn unregister_remote_proxy(&self, proxy: ProxyAddress, reason: DisconnectReason, cookie: Cookie);

    /// The router link is up.
    fn remote_service_started(&self, channel: Channel);

    /// The router link was closed.
    fn remote_service_stopped(&self, channel: Channel);

    /// The router link broke.
    fn remote_service_connection_lost(&self, channel: Channel);
}

/// Kernel services used by proxies.
pub trait ServiceConnector: Send + Sync {
    fn register_proxy(&self, proxy: ProxyAddress);

    fn unregister_proxy(&self, proxy: ProxyAddress, reason: DisconnectReason);

    /// Route an event to its destination thread or through the router.
    fn send_event(&self, event: ServiceEvent) -> bool;
}

/// [`RouterClient`] writing encoded router messages to a queue.
pub struct QueuedRouterClient {
    outbound: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
}

impl QueuedRouterClient {
    /// Returns the client and the queue the transport drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        (
            Self {
                outbound,
                connected: AtomicBool::new(false),
            },
            receiver,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn send(&self, message: RouterMessage) -> bool {
        if !self.is_connected() {
            debug!("Router link down, message not sent");
            return false;
        }
        self.outbound.send(encode_message(&message)).is_ok()
    }
}

impl RouterClient for QueuedRouterClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn register_stub(&self, stub: &StubAddress) -> bool {
        self.send(RouterMessage::RegisterStub(stub.clone()))
    }

    fn unregister_stub(&self, stub: &StubAddress, reason: DisconnectReason) -> bool {
        self.send(RouterMessage::UnregisterStub {
            stub: stub.clone(),
            reason,
        })
    }

    fn register_proxy(&self, proxy: &ProxyAddress) -> bool {
        self.send(RouterMessage::RegisterProxy(proxy.clone()))
    }

    fn unregister_proxy(&self, proxy: &ProxyAddress, reason: DisconnectReason) -> bool {
        self.send(RouterMessage::UnregisterProxy {
            proxy: proxy.clone(),
            reason,
        })
    }

    fn relay_event(&self, event: ServiceEvent) -> bool {
        self.send(RouterMessage::Event(event))
    }
}

/// Feeds messages received from the router into a [`ServiceManager`].
pub struct RouterLink {
    manager: Arc<ServiceManager>,
}

impl RouterLink {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    /// Decode and apply one message received over the connection `peer`.
    pub fn receive(&self, peer: Cookie, body: Bytes) -> Result<(), WireError> {
        match decode_message(body)? {
            RouterMessage::RegisterStub(mut stub) => {
                stamp_stub(&mut stub, peer);
                self.manager.register_remote_stub(stub);
            }
            RouterMessage::UnregisterStub { mut stub, reason } => {
                stamp_stub(&mut stub, peer);
                self.manager.unregister_remote_stub(stub, reason, peer);
            }
            RouterMessage::RegisterProxy(mut proxy) => {
                stamp_proxy(&mut proxy, peer);
                self.manager.register_remote_proxy(proxy);
            }
            RouterMessage::UnregisterProxy { mut proxy, reason } => {
                stamp_proxy(&mut proxy, peer);
                self.manager.unregister_remote_proxy(proxy, reason, peer);
            }
            RouterMessage::Event(mut event) => {
                if self.localize(&mut event, peer) {
                    self.manager.deliver_event(event);
                }
            }
        }
        Ok(())
    }

    /// Apply every message from `inbound` until the queue closes.
    pub async fn run(self, peer: Cookie, mut inbound: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(body) = inbound.recv().await {
            if let Err(e) = self.receive(peer, body) {
                warn!(peer = %peer, error = %e, "Discarding malformed router message");
            }
        }
        debug!(peer = %peer, "Router link closed");
    }

    /// Rewrite an inbound event so its destination resolves to a local
    /// thread and its origin to the peer connection.
    fn localize(&self, event: &mut ServiceEvent, peer: Cookie) -> bool {
        let threads = self.manager.threads();
        let resolve = |name: &str| -> Option<ThreadId> {
            let id = threads.thread_id(name);
            if id.is_none() {
                debug!(thread = %name, "Inbound event for unknown thread dropped");
            }
            id
        };

        match event {
            ServiceEvent::ProxyConnection(e) => {
                let Some(id) = resolve(e.proxy.thread_name()) else {
                    return false;
                };
                e.proxy.set_channel(Channel::local(id));
                stamp_stub(&mut e.stub, peer);
            }
            ServiceEvent::StubConnection(e) => {
                let Some(id) = resolve(e.stub.thread_name()) else {
                    return false;
                };
                e.stub.set_channel(Channel::local(id));
                stamp_proxy(&mut e.proxy, peer);
            }
            ServiceEvent::Request(e) => {
                let Some(id) = resolve(e.stub.thread_name()) else {
                    return false;
                };
                e.stub.set_channel(Channel::local(id));
                stamp_proxy(&mut e.proxy, peer);
            }
            ServiceEvent::NotifyRequest(e) => {
                let Some(id) = resolve(e.stub.thread_name()) else {
                    return false;
                };
                e.stub.set_channel(Channel::local(id));
                stamp_proxy(&mut e.proxy, peer);
            }
            ServiceEvent::Response(e) => {
                let Some(id) = resolve(e.proxy.thread_name()) else {
                    return false;
                };
                e.proxy.set_channel(Channel::local(id));
            }
        }
        true
    }
}

/// Addresses announced by a peer are reached through its connection.
fn stamp_stub(stub: &mut StubAddress, peer: Cookie) {
    if !stub.is_remote() {
        stub.set_channel(Channel::new(peer, ThreadId::UNKNOWN, ThreadId::UNKNOWN));
    }
}

fn stamp_proxy(proxy: &mut ProxyAddress, peer: Cookie) {
    if !proxy.is_remote() {
        proxy.set_channel(Channel::new(peer, ThreadId::UNKNOWN, ThreadId::UNKNOWN));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svclink_types::{ServiceItem, ServiceType, Version};

    fn public_stub() -> StubAddress {
        let mut stub = StubAddress::new(
            ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Public),
            "CalcRole",
            "worker",
        );
        stub.set_channel(Channel::local(ThreadId(3)));
        stub
    }

    #[test]
    fn test_queued_client_requires_connection() {
        let (client, mut rx) = QueuedRouterClient::new();
        assert!(!client.register_stub(&public_stub()));
        assert!(rx.try_recv().is_err());

        client.set_connected(true);
        assert!(client.register_stub(&public_stub()));
        let bytes = rx.try_recv().unwrap();
        match decode_message(bytes).unwrap() {
            RouterMessage::RegisterStub(stub) => {
                assert_eq!(stub, public_stub());
                assert_eq!(stub.cookie(), Cookie::LOCAL);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_closed_queue_reads_as_disconnected() {
        let (client, rx) = QueuedRouterClient::new();
        client.set_connected(true);
        drop(rx);
        assert!(!client.is_connected());
        assert!(!client.unregister_stub(&public_stub(), DisconnectReason::ProviderDisconnected));
    }

    #[test]
    fn test_stamp_keeps_remote_cookie() {
        let mut stub = public_stub();
        stamp_stub(&mut stub, Cookie(300));
        assert_eq!(stub.cookie(), Cookie(300));
        assert_eq!(stub.source(), ThreadId::UNKNOWN);

        stamp_stub(&mut stub, Cookie(301));
        assert_eq!(stub.cookie(), Cookie(300));
    }
}
