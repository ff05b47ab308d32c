//! Shared proxy handles and the proxy-by-address table.
//!
//! Several consumers on one thread may use the same remote service through a
//! single proxy. [`ProxyRegistry::get_or_create`] hands out [`ProxyHandle`]s
//! to one shared instance; when the last handle is dropped the proxy
//! unregisters from the service manager.

use crate::consumer::{run_deliveries, ConsumerId, ProxyConsumer};
use crate::interface::InterfaceTable;
use crate::listener::Listener;
use crate::proxy::Proxy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use svclink_kernel::ServiceConnector;
use svclink_types::event::ServiceEvent;
use svclink_types::{
    ConnectionState, DisconnectReason, MessageId, ProxyAddress, SequenceNumber,
};
use tracing::debug;

struct ProxyCell {
    address: ProxyAddress,
    proxy: Mutex<Proxy>,
    connector: Arc<dyn ServiceConnector>,
    registry: Weak<RegistryInner>,
}

impl Drop for ProxyCell {
    fn drop(&mut self) {
        debug!(proxy = %self.address, "Last proxy handle dropped");
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.address, self.connector.as_ref()),
            None => self
                .connector
                .unregister_proxy(self.address.clone(), DisconnectReason::ConsumerDisconnected),
        }
    }
}

/// Shared reference to one proxy.
#[derive(Clone)]
pub struct ProxyHandle(Arc<ProxyCell>);

impl ProxyHandle {
    /// Run `f` on the proxy, then run the callbacks it produced with the
    /// lock released.
    fn with<R>(&self, f: impl FnOnce(&mut Proxy) -> R) -> R {
        let (result, deliveries) = {
            let mut proxy = self.lock();
            let result = f(&mut proxy);
            (result, proxy.take_deliveries())
        };
        run_deliveries(deliveries);
        result
    }

    fn lock(&self) -> MutexGuard<'_, Proxy> {
        self.0.proxy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Address the proxy was registered under.
    pub fn address(&self) -> &ProxyAddress {
        &self.0.address
    }

    /// Current connection state toward the provider.
    pub fn state(&self) -> ConnectionState {
        self.lock().state()
    }

    /// Whether requests are currently routed to a stub.
    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    /// Number of handles sharing this proxy.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Pending responses and active subscriptions, summed over consumers.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners().len()
    }

    /// Last value received for an attribute or broadcast.
    pub fn cached_value(&self, message_id: MessageId) -> Option<Vec<u8>> {
        self.lock().cached_value(message_id).map(<[u8]>::to_vec)
    }

    /// Attach a consumer. A connected proxy reports its state to the new
    /// consumer right away. Returns false when `id` is already attached.
    pub fn add_consumer(&self, id: ConsumerId, consumer: Arc<dyn ProxyConsumer>) -> bool {
        self.with(|p| p.add_consumer(id, consumer))
    }

    /// Detach a consumer, dropping its listeners and stopping the
    /// notifications it was the last subscriber of.
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        self.with(|p| p.remove_consumer(id))
    }

    pub fn add_listener(
        &self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
        consumer: ConsumerId,
    ) -> bool {
        self.with(|p| p.add_listener(message_id, sequence_nr, consumer))
    }

    pub fn remove_listener(
        &self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
        consumer: ConsumerId,
    ) -> bool {
        self.with(|p| p.remove_listener(message_id, sequence_nr, consumer))
    }

    /// Drop every listener of `consumer`; returns the ids it listened on.
    pub fn unregister_listener(&self, consumer: ConsumerId) -> Vec<MessageId> {
        self.with(|p| p.unregister_listener(consumer))
    }

    pub fn set_notification(
        &self,
        message_id: MessageId,
        consumer: ConsumerId,
        always_notify: bool,
    ) -> bool {
        self.with(|p| p.set_notification(message_id, consumer, always_notify))
    }

    pub fn clear_notification(&self, message_id: MessageId, consumer: ConsumerId) -> bool {
        self.with(|p| p.clear_notification(message_id, consumer))
    }

    pub fn prepare_listeners(
        &self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
    ) -> Vec<Listener> {
        self.lock().prepare_listeners(message_id, sequence_nr)
    }

    /// Send a request on behalf of `consumer`.
    ///
    /// While the proxy is not connected the consumer gets an undelivered
    /// response straight away and nothing is sent.
    pub fn send_request(
        &self,
        request_id: MessageId,
        consumer: ConsumerId,
        payload: Vec<u8>,
    ) -> SequenceNumber {
        self.with(|p| p.send_request(request_id, consumer, payload))
    }

    /// Forget the pending call with `sequence_nr`.
    pub fn cancel_request(&self, sequence_nr: SequenceNumber) -> bool {
        self.with(|p| p.cancel_request(sequence_nr))
    }

    /// Apply an event routed to this proxy and run the resulting callbacks.
    pub fn process_event(&self, event: ServiceEvent) {
        self.with(|p| p.process_event(event))
    }
}

struct RegistryInner {
    proxies: Mutex<HashMap<ProxyAddress, Weak<ProxyCell>>>,
    connector: Arc<dyn ServiceConnector>,
}

impl RegistryInner {
    fn map(&self) -> MutexGuard<'_, HashMap<ProxyAddress, Weak<ProxyCell>>> {
        self.proxies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the entry of a dead proxy and unregister it from the manager.
    ///
    /// Runs under the map lock, as does registration in `get_or_create`, so
    /// the manager sees register and unregister requests of one address in
    /// the order the table changed. A live replacement created after the
    /// last handle went away keeps both its entry and its registration.
    fn release(&self, address: &ProxyAddress, connector: &dyn ServiceConnector) {
        let mut map = self.map();
        if map.get(address).is_some_and(|weak| weak.strong_count() > 0) {
            debug!(proxy = %address, "Proxy was recreated, registration kept");
            return;
        }
        map.remove(address);
        connector.unregister_proxy(address.clone(), DisconnectReason::ConsumerDisconnected);
    }

    fn new_cell(
        self: &Arc<Self>,
        address: &ProxyAddress,
        interface: Arc<InterfaceTable>,
    ) -> Arc<ProxyCell> {
        Arc::new(ProxyCell {
            address: address.clone(),
            proxy: Mutex::new(Proxy::new(
                address.clone(),
                interface,
                self.connector.clone(),
            )),
            connector: self.connector.clone(),
            registry: Arc::downgrade(self),
        })
    }
}

/// Table of live proxies keyed by address.
#[derive(Clone)]
pub struct ProxyRegistry {
    inner: Arc<RegistryInner>,
}

impl ProxyRegistry {
    /// Empty table whose proxies talk to the manager through `connector`.
    pub fn new(connector: Arc<dyn ServiceConnector>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                proxies: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    /// Share the live proxy for `address` or create and register a new one.
    pub fn get_or_create(
        &self,
        address: ProxyAddress,
        interface: Arc<InterfaceTable>,
    ) -> ProxyHandle {
        let mut map = self.inner.map();
        if let Some(live) = map.get(&address).and_then(Weak::upgrade) {
            return ProxyHandle(live);
        }
        let cell = self.inner.new_cell(&address, interface);
        map.insert(address.clone(), Arc::downgrade(&cell));
        debug!(proxy = %address, "Proxy created");
        self.inner.connector.register_proxy(address);
        ProxyHandle(cell)
    }

    /// Live proxy registered under exactly `address`.
    pub fn find(&self, address: &ProxyAddress) -> Option<ProxyHandle> {
        let map = self.inner.map();
        map.get(address).and_then(Weak::upgrade).map(ProxyHandle)
    }

    /// Live proxies hosted by `thread_name`.
    pub fn proxies_on_thread(&self, thread_name: &str) -> Vec<ProxyHandle> {
        let map = self.inner.map();
        map.iter()
            .filter(|(address, _)| address.thread_name() == thread_name)
            .filter_map(|(_, weak)| weak.upgrade())
            .map(ProxyHandle)
            .collect()
    }

    /// Number of proxies with at least one live handle.
    pub fn len(&self) -> usize {
        self.inner
            .map()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route an event received by a dispatcher thread to its proxy.
    pub fn dispatch(&self, event: ServiceEvent) -> bool {
        let address = match &event {
            ServiceEvent::ProxyConnection(e) => &e.proxy,
            ServiceEvent::Response(e) => &e.proxy,
            other => {
                debug!(kind = other.kind(), "Event not meant for a proxy");
                return false;
            }
        };
        let Some(handle) = self.find(address) else {
            debug!(proxy = %address, kind = event.kind(), "Event for unknown proxy dropped");
            return false;
        };
        handle.process_event(event);
        true
    }
}
