//! Events exchanged between stubs, proxies and the service manager.
//!
//! All cross-component interaction flows through these events: a request is
//! an event posted to the provider's thread, its answer a later event posted
//! back to the consumer's thread. The variants form a closed set so each
//! receiving side can dispatch with a single `match`.

use crate::address::{ProxyAddress, StubAddress};
use crate::channel::{Cookie, ThreadId};
use crate::message::{MessageId, NotifyRequest, ResultType, SequenceNumber};
use crate::state::{ConnectionState, DisconnectReason};
use serde::Serialize;

/// Connection change delivered to a proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConnectionEvent {
    /// The proxy being notified, with its channel as currently linked.
    pub proxy: ProxyAddress,
    /// The provider it is (or was) connected to.
    pub stub: StubAddress,
    pub state: ConnectionState,
    pub reason: DisconnectReason,
}

/// Client connection change delivered to a stub.
#[derive(Debug, Clone, Serialize)]
pub struct StubConnectionEvent {
    pub stub: StubAddress,
    /// The consumer that connected or went away.
    pub proxy: ProxyAddress,
    pub state: ConnectionState,
    pub reason: DisconnectReason,
}

/// A call from a proxy to its stub.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub proxy: ProxyAddress,
    pub stub: StubAddress,
    pub message_id: MessageId,
    pub sequence_nr: SequenceNumber,
    pub payload: Vec<u8>,
}

/// Start or stop notifications of an attribute or broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyRequestEvent {
    pub proxy: ProxyAddress,
    pub stub: StubAddress,
    pub message_id: MessageId,
    pub request: NotifyRequest,
}

/// A response, attribute update or broadcast delivered to a proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEvent {
    pub proxy: ProxyAddress,
    pub message_id: MessageId,
    pub sequence_nr: SequenceNumber,
    pub result: ResultType,
    pub payload: Vec<u8>,
}

impl ResponseEvent {
    pub fn new(
        proxy: ProxyAddress,
        message_id: MessageId,
        sequence_nr: SequenceNumber,
        result: ResultType,
    ) -> Self {
        Self {
            proxy,
            message_id,
            sequence_nr,
            result,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

/// Every event a dispatcher thread may receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServiceEvent {
    ProxyConnection(ProxyConnectionEvent),
    StubConnection(StubConnectionEvent),
    Request(RequestEvent),
    NotifyRequest(NotifyRequestEvent),
    Response(ResponseEvent),
}

impl ServiceEvent {
    /// Thread the event must be posted to.
    pub fn target_thread(&self) -> ThreadId {
        match self {
            ServiceEvent::ProxyConnection(e) => e.proxy.source(),
            ServiceEvent::StubConnection(e) => e.stub.source(),
            ServiceEvent::Request(e) => e.stub.source(),
            ServiceEvent::NotifyRequest(e) => e.stub.source(),
            ServiceEvent::Response(e) => e.proxy.source(),
        }
    }

    /// Cookie of the receiving endpoint; remote cookies go through the router.
    pub fn target_cookie(&self) -> Cookie {
        match self {
            ServiceEvent::ProxyConnection(e) => e.proxy.cookie(),
            ServiceEvent::StubConnection(e) => e.stub.cookie(),
            ServiceEvent::Request(e) => e.stub.cookie(),
            ServiceEvent::NotifyRequest(e) => e.stub.cookie(),
            ServiceEvent::Response(e) => e.proxy.cookie(),
        }
    }

    /// Whether delivery goes through the router instead of a local queue.
    pub fn is_remote_target(&self) -> bool {
        self.target_cookie().is_remote()
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::ProxyConnection(_) => "proxy_connection",
            ServiceEvent::StubConnection(_) => "stub_connection",
            ServiceEvent::Request(_) => "request",
            ServiceEvent::NotifyRequest(_) => "notify_request",
            ServiceEvent::Response(_) => "response",
        }
    }
}
