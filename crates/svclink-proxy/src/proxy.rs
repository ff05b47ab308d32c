//! Per-proxy listener and notification state.
//!
//! A [`Proxy`] is touched only from the thread that owns it. Consumer
//! callbacks are not run from inside its methods: results are queued as
//! deliveries and run by the owning [`ProxyHandle`](crate::ProxyHandle)
//! once its lock is released, so a callback may call back into the proxy.

use crate::consumer::{ConsumerId, Delivery, ProxyConsumer, ProxyResponse};
use crate::interface::InterfaceTable;
use crate::listener::{Listener, ListenerList};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use svclink_kernel::ServiceConnector;
use svclink_types::event::{
    NotifyRequestEvent, ProxyConnectionEvent, RequestEvent, ResponseEvent, ServiceEvent,
};
use svclink_types::{
    ConnectionState, MessageId, NotifyRequest, ProxyAddress, ResultType, SequenceNumber,
    StubAddress,
};
use tracing::{debug, info, warn};

pub struct Proxy {
    address: ProxyAddress,
    stub: Option<StubAddress>,
    state: ConnectionState,
    interface: Arc<InterfaceTable>,
    connector: Arc<dyn ServiceConnector>,
    consumers: BTreeMap<ConsumerId, Arc<dyn ProxyConsumer>>,
    listeners: ListenerList,
    /// Last valid value per attribute; absent means invalid.
    cache: HashMap<MessageId, Vec<u8>>,
    sequence: SequenceNumber,
    pending: Vec<Delivery>,
}

impl Proxy {
    pub fn new(
        address: ProxyAddress,
        interface: Arc<InterfaceTable>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Self {
        let state = if address.is_valid() {
            ConnectionState::Pending
        } else {
            ConnectionState::Unknown
        };
        Self {
            address,
            stub: None,
            state,
            interface,
            connector,
            consumers: BTreeMap::new(),
            listeners: ListenerList::new(),
            cache: HashMap::new(),
            sequence: SequenceNumber::NOTIFY,
            pending: Vec::new(),
        }
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.address
    }

    /// The stub this proxy is connected to.
    pub fn stub(&self) -> Option<&StubAddress> {
        self.stub.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Outstanding responses and subscriptions.
    pub fn listeners(&self) -> &ListenerList {
        &self.listeners
    }

    /// Last notified value of an attribute or broadcast, if any.
    pub fn cached_value(&self, message_id: MessageId) -> Option<&[u8]> {
        self.cache.get(&message_id).map(Vec::as_slice)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Attach a consumer. A consumer joining a connected proxy is told so.
    pub fn add_consumer(&mut self, id: ConsumerId, consumer: Arc<dyn ProxyConsumer>) -> bool {
        if self.consumers.contains_key(&id) {
            return false;
        }
        if self.is_connected() {
            self.pending.push(Delivery::Connection {
                id,
                consumer: consumer.clone(),
                proxy: self.address.clone(),
                state: self.state,
            });
        }
        self.consumers.insert(id, consumer);
        true
    }

    /// Detach a consumer and drop all of its listeners.
    pub fn remove_consumer(&mut self, id: ConsumerId) -> bool {
        self.unregister_listener(id);
        self.consumers.remove(&id).is_some()
    }

    pub fn add_listener(
        &mut self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
        consumer: ConsumerId,
    ) -> bool {
        self.listeners
            .add(Listener::new(message_id, sequence_nr, consumer))
    }

    pub fn remove_listener(
        &mut self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
        consumer: ConsumerId,
    ) -> bool {
        let removed = self
            .listeners
            .remove(&Listener::new(message_id, sequence_nr, consumer))
            > 0;
        if removed {
            self.release_notification(message_id);
        }
        removed
    }

    /// Remove every listener of `consumer`. Returns the affected message ids.
    pub fn unregister_listener(&mut self, consumer: ConsumerId) -> Vec<MessageId> {
        let affected = self.listeners.remove_consumer(consumer);
        for message_id in &affected {
            self.release_notification(*message_id);
        }
        affected
    }

    /// Subscribe `consumer` to an attribute or broadcast.
    ///
    /// The first subscriber starts notifications upstream. Later subscribers
    /// are served from the cache without a round trip; with `always_notify`
    /// they get an answer even when no valid value is cached.
    pub fn set_notification(
        &mut self,
        message_id: MessageId,
        consumer: ConsumerId,
        always_notify: bool,
    ) -> bool {
        if !self.interface.is_notification(message_id) {
            warn!(proxy = %self.address, message = %message_id, "Not an attribute or broadcast");
            return false;
        }

        let first = !self.listeners.has_message(message_id);
        let added = self
            .listeners
            .add(Listener::new(message_id, SequenceNumber::NOTIFY, consumer));

        if first {
            self.send_notify_request(message_id, NotifyRequest::Start);
        } else if let Some(value) = self.cache.get(&message_id).cloned() {
            if added || always_notify {
                self.queue_response(
                    consumer,
                    ProxyResponse {
                        message_id,
                        sequence_nr: SequenceNumber::NOTIFY,
                        result: ResultType::NotifyOk,
                        payload: value,
                    },
                );
            }
        } else if always_notify {
            self.queue_response(
                consumer,
                ProxyResponse {
                    message_id,
                    sequence_nr: SequenceNumber::NOTIFY,
                    result: ResultType::DataInvalid,
                    payload: Vec::new(),
                },
            );
        }
        added
    }

    pub fn clear_notification(&mut self, message_id: MessageId, consumer: ConsumerId) -> bool {
        self.remove_listener(message_id, SequenceNumber::NOTIFY, consumer)
    }

    /// Listeners a result for (`message_id`, `sequence_nr`) would reach.
    pub fn prepare_listeners(
        &self,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
    ) -> Vec<Listener> {
        self.listeners.prepare(message_id, sequence_nr)
    }

    /// Deliver a result to every matching listener. Returns how many matched.
    pub fn notify_listeners(&mut self, response: &ResponseEvent) -> usize {
        let message_id = self
            .interface
            .listener_id(response.message_id, response.result);
        debug_assert!(
            self.interface.is_known(message_id),
            "response for unknown message id {message_id}"
        );
        if !self.interface.is_known(message_id) {
            debug!(proxy = %self.address, message = %message_id, "Response for unknown message ignored");
            return 0;
        }

        let notification = self.interface.is_notification(message_id);
        let search = if notification {
            if response.result.is_success() {
                self.cache.insert(message_id, response.payload.clone());
            } else {
                self.cache.remove(&message_id);
            }
            SequenceNumber::ANY
        } else {
            response.sequence_nr
        };

        let targets = self.prepare_listeners(message_id, search);
        if targets.is_empty() {
            debug!(
                proxy = %self.address,
                message = %message_id,
                seq = %response.sequence_nr,
                "No listener for response"
            );
        }
        for listener in &targets {
            if !notification {
                self.listeners.remove_identical(listener);
            }
            self.queue_response(
                listener.consumer,
                ProxyResponse {
                    message_id,
                    sequence_nr: response.sequence_nr,
                    result: response.result,
                    payload: response.payload.clone(),
                },
            );
        }
        targets.len()
    }

    /// Post a request to the stub and return its sequence number.
    ///
    /// If the request cannot be posted the caller is answered locally with
    /// [`ResultType::MessageUndelivered`].
    pub fn send_request(
        &mut self,
        request_id: MessageId,
        consumer: ConsumerId,
        payload: Vec<u8>,
    ) -> SequenceNumber {
        self.sequence = self.sequence.next();
        let sequence_nr = self.sequence;
        if let Some(response_id) = self.interface.response_for(request_id) {
            self.listeners
                .add(Listener::new(response_id, sequence_nr, consumer));
        }

        let delivered = match self.connected_stub() {
            Some(stub) => self.connector.send_event(ServiceEvent::Request(RequestEvent {
                proxy: self.address.clone(),
                stub,
                message_id: request_id,
                sequence_nr,
                payload,
            })),
            None => false,
        };
        if !delivered {
            debug!(
                proxy = %self.address,
                message = %request_id,
                seq = %sequence_nr,
                state = %self.state,
                "Request undelivered"
            );
            let failure = ResponseEvent::new(
                self.address.clone(),
                request_id,
                sequence_nr,
                ResultType::MessageUndelivered,
            );
            self.notify_listeners(&failure);
        }
        sequence_nr
    }

    /// Answer the call `sequence_nr` with [`ResultType::RequestCanceled`].
    pub fn cancel_request(&mut self, sequence_nr: SequenceNumber) -> bool {
        if sequence_nr == SequenceNumber::NOTIFY || sequence_nr.is_any() {
            return false;
        }
        let mut waiting: Vec<MessageId> = self
            .listeners
            .iter()
            .filter(|l| l.sequence_nr == sequence_nr)
            .map(|l| l.message_id)
            .collect();
        waiting.dedup();
        for message_id in &waiting {
            let canceled = ResponseEvent::new(
                self.address.clone(),
                *message_id,
                sequence_nr,
                ResultType::RequestCanceled,
            );
            self.notify_listeners(&canceled);
        }
        !waiting.is_empty()
    }

    /// Handle an event the dispatcher thread received for this proxy.
    pub fn process_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::ProxyConnection(e) => self.on_connection(e),
            ServiceEvent::Response(e) => {
                self.notify_listeners(&e);
            }
            other => {
                debug!(proxy = %self.address, kind = other.kind(), "Event not meant for a proxy ignored");
            }
        }
    }

    pub(crate) fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.pending)
    }

    fn on_connection(&mut self, event: ProxyConnectionEvent) {
        if !self.state.can_transition_to(event.state) {
            debug!(
                proxy = %self.address,
                from = %self.state,
                to = %event.state,
                "Connection event rejected, illegal transition"
            );
            return;
        }
        if !event.state.is_connected() && self.stub.as_ref().is_some_and(|s| *s != event.stub) {
            debug!(proxy = %self.address, stub = %event.stub, "Disconnect from a foreign stub ignored");
            return;
        }
        self.address.set_channel(event.proxy.channel());
        self.state = event.state;

        if event.state.is_connected() {
            info!(proxy = %self.address, stub = %event.stub, "Proxy connected");
            self.stub = Some(event.stub);
            for message_id in self.listeners.message_ids() {
                if self.interface.is_notification(message_id) {
                    self.send_notify_request(message_id, NotifyRequest::Start);
                }
            }
        } else {
            info!(
                proxy = %self.address,
                state = %event.state,
                reason = ?event.reason,
                "Proxy disconnected"
            );
            self.stub = None;
            self.cache.clear();
            self.cancel_pending();
        }

        for (id, consumer) in &self.consumers {
            self.pending.push(Delivery::Connection {
                id: *id,
                consumer: consumer.clone(),
                proxy: self.address.clone(),
                state: self.state,
            });
        }
    }

    fn cancel_pending(&mut self) {
        let mut calls: Vec<SequenceNumber> = self
            .listeners
            .iter()
            .map(|l| l.sequence_nr)
            .filter(|seq| *seq != SequenceNumber::NOTIFY && !seq.is_any())
            .collect();
        calls.sort();
        calls.dedup();
        for sequence_nr in calls {
            self.cancel_request(sequence_nr);
        }
    }

    /// Stop notifications nobody listens to anymore.
    fn release_notification(&mut self, message_id: MessageId) {
        if self.interface.is_notification(message_id) && !self.listeners.has_message(message_id) {
            self.send_notify_request(message_id, NotifyRequest::Stop);
            self.cache.remove(&message_id);
        }
    }

    fn send_notify_request(&mut self, message_id: MessageId, request: NotifyRequest) -> bool {
        let Some(stub) = self.connected_stub() else {
            debug!(proxy = %self.address, message = %message_id, ?request, "Not connected, notify request deferred");
            return false;
        };
        self.connector
            .send_event(ServiceEvent::NotifyRequest(NotifyRequestEvent {
                proxy: self.address.clone(),
                stub,
                message_id,
                request,
            }))
    }

    fn connected_stub(&self) -> Option<StubAddress> {
        if self.is_connected() {
            self.stub.clone()
        } else {
            None
        }
    }

    fn queue_response(&mut self, consumer: ConsumerId, response: ProxyResponse) {
        match self.consumers.get(&consumer) {
            Some(handler) => self.pending.push(Delivery::Response {
                id: consumer,
                consumer: handler.clone(),
                response,
            }),
            None => {
                debug!(proxy = %self.address, consumer = %consumer, "Listener without consumer skipped");
            }
        }
    }
}
