use svclink_types::{ConnectionState, ProxyAddress, StubAddress, ThreadId};
use tracing::debug;

/// A consumer known to the registry and its connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    proxy: ProxyAddress,
    state: ConnectionState,
}

impl ClientInfo {
    /// A valid proxy starts out waiting for its provider.
    pub fn new(proxy: ProxyAddress) -> Self {
        let state = if proxy.is_valid() {
            ConnectionState::Pending
        } else {
            ConnectionState::Unknown
        };
        Self { proxy, state }
    }

    /// The consumer address, with its target set while connected.
    pub fn proxy(&self) -> &ProxyAddress {
        &self.proxy
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a provider currently serves this consumer.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Connect to `stub`, pointing the proxy channel at the stub's thread.
    ///
    /// Rejected without mutation when the client is in the unknown state or
    /// the stub cannot serve it.
    pub fn connect(&mut self, stub: &StubAddress) -> bool {
        if self.state == ConnectionState::Unknown || !self.proxy.is_stub_compatible(stub) {
            debug!(proxy = %self.proxy, stub = %stub, state = ?self.state, "Client connect rejected");
            return false;
        }
        self.proxy.set_target(stub.source());
        self.state = ConnectionState::Connected;
        true
    }

    /// Revert a connected client to pending. Returns whether it was connected.
    pub fn disconnect(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.proxy.set_target(ThreadId::UNKNOWN);
        self.state = ConnectionState::Pending;
        true
    }

    /// Take over a re-registered address (new channel) keeping the state.
    pub(crate) fn update_address(&mut self, proxy: &ProxyAddress) {
        let target = self.proxy.target();
        self.proxy = proxy.clone();
        self.proxy.set_target(target);
        if self.state == ConnectionState::Unknown && self.proxy.is_valid() {
            self.state = ConnectionState::Pending;
        }
    }
}

/// A provider entry: the registered stub, or a placeholder created by a
/// consumer that asked for it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    stub: StubAddress,
    state: ConnectionState,
}

impl ServerInfo {
    /// Registered when the stub is operable, pending when it only names a
    /// valid service.
    pub fn new(stub: StubAddress) -> Self {
        let state = if stub.is_valid() {
            ConnectionState::Connected
        } else if stub.is_validated() {
            ConnectionState::Pending
        } else {
            ConnectionState::Unknown
        };
        Self { stub, state }
    }

    /// Placeholder for the provider `proxy` is looking for.
    pub fn placeholder(proxy: &ProxyAddress) -> Self {
        Self {
            stub: StubAddress::from_service(proxy.service().clone(), ""),
            state: ConnectionState::Pending,
        }
    }

    /// A provider that just went away; keeps its last channel.
    pub(crate) fn departed(stub: StubAddress) -> Self {
        Self {
            stub,
            state: ConnectionState::Pending,
        }
    }

    /// The registered stub, or the placeholder address.
    pub fn stub(&self) -> &StubAddress {
        &self.stub
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a provider is currently registered.
    pub fn is_registered(&self) -> bool {
        self.state.is_connected()
    }

    /// Whether the registered provider can serve `proxy`.
    pub fn can_serve(&self, proxy: &ProxyAddress) -> bool {
        self.is_registered() && self.stub.is_proxy_compatible(proxy)
    }

    pub(crate) fn register(&mut self, stub: &StubAddress) {
        self.stub = stub.clone();
        self.state = ConnectionState::Connected;
    }

    pub(crate) fn unregister(&mut self) {
        self.stub.set_channel(Default::default());
        self.state = ConnectionState::Pending;
    }
}

/// Consumers of one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientList {
    clients: Vec<ClientInfo>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup by full address, channel included.
    pub fn find(&self, proxy: &ProxyAddress) -> Option<&ClientInfo> {
        self.clients.iter().find(|c| c.proxy == *proxy)
    }

    /// Find the entry for `proxy`, updating its address, or add a new one.
    pub(crate) fn insert_or_find(&mut self, proxy: &ProxyAddress) -> &mut ClientInfo {
        match self.clients.iter().position(|c| c.proxy == *proxy) {
            Some(index) => {
                let client = &mut self.clients[index];
                client.update_address(proxy);
                client
            }
            None => {
                self.clients.push(ClientInfo::new(proxy.clone()));
                let last = self.clients.len() - 1;
                &mut self.clients[last]
            }
        }
    }

    pub(crate) fn remove(&mut self, proxy: &ProxyAddress) -> Option<ClientInfo> {
        let index = self.clients.iter().position(|c| c.proxy == *proxy)?;
        Some(self.clients.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientInfo> {
        self.clients.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot for callers outside the registry lock.
    pub fn to_vec(&self) -> Vec<ClientInfo> {
        self.clients.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svclink_types::{Channel, Cookie, ServiceItem, ServiceType, Version};

    fn item(minor: u32) -> ServiceItem {
        ServiceItem::new("Calc", Version::new(1, minor, 0), ServiceType::Local)
    }

    fn stub(thread: u64) -> StubAddress {
        let mut stub = StubAddress::new(item(2), "CalcRole", "worker");
        stub.set_channel(Channel::local(ThreadId(thread)));
        stub
    }

    fn proxy(thread: u64) -> ProxyAddress {
        let mut proxy = ProxyAddress::new(item(0), "CalcRole", "ui");
        proxy.set_channel(Channel::local(ThreadId(thread)));
        proxy
    }

    #[test]
    fn test_client_connect_sets_target() {
        let mut client = ClientInfo::new(proxy(5));
        assert_eq!(client.state(), ConnectionState::Pending);
        assert!(client.connect(&stub(9)));
        assert!(client.is_connected());
        assert_eq!(client.proxy().target(), ThreadId(9));

        assert!(client.disconnect());
        assert_eq!(client.state(), ConnectionState::Pending);
        assert_eq!(client.proxy().target(), ThreadId::UNKNOWN);
        assert!(!client.disconnect());
    }

    #[test]
    fn test_unknown_client_cannot_connect() {
        let mut client = ClientInfo::new(ProxyAddress::new(item(0), "CalcRole", "ui"));
        assert_eq!(client.state(), ConnectionState::Unknown);
        assert!(!client.connect(&stub(9)));
        assert_eq!(client.state(), ConnectionState::Unknown);
        assert_eq!(client.proxy().target(), ThreadId::UNKNOWN);
    }

    #[test]
    fn test_incompatible_stub_rejected() {
        let mut newer = ProxyAddress::new(item(7), "CalcRole", "ui");
        newer.set_channel(Channel::local(ThreadId(3)));
        let mut client = ClientInfo::new(newer);
        assert_eq!(client.state(), ConnectionState::Pending);
        assert!(!client.connect(&stub(9)));
        assert_eq!(client.state(), ConnectionState::Pending);
    }

    #[test]
    fn test_update_address_promotes_unknown_client() {
        let mut client = ClientInfo::new(ProxyAddress::new(item(0), "CalcRole", "ui"));
        assert_eq!(client.state(), ConnectionState::Unknown);
        client.update_address(&proxy(3));
        assert_eq!(client.state(), ConnectionState::Pending);
        assert_eq!(client.proxy().source(), ThreadId(3));
    }

    #[test]
    fn test_server_info_states() {
        assert!(ServerInfo::new(stub(1)).is_registered());
        let unbound = StubAddress::new(item(2), "CalcRole", "worker");
        assert_eq!(ServerInfo::new(unbound).state(), ConnectionState::Pending);
        assert_eq!(
            ServerInfo::new(StubAddress::invalid()).state(),
            ConnectionState::Unknown
        );

        let mut placeholder = ServerInfo::placeholder(&proxy(4));
        assert!(!placeholder.is_registered());
        assert!(!placeholder.can_serve(&proxy(4)));
        placeholder.register(&stub(1));
        assert!(placeholder.can_serve(&proxy(4)));
        placeholder.unregister();
        assert_eq!(placeholder.state(), ConnectionState::Pending);
        assert_eq!(placeholder.stub().cookie(), Cookie::UNKNOWN);
    }

    #[test]
    fn test_client_list_dedups_by_address() {
        let mut list = ClientList::new();
        list.insert_or_find(&proxy(5));
        list.insert_or_find(&proxy(6));
        assert_eq!(list.len(), 1);
        assert_eq!(list.find(&proxy(5)).unwrap().proxy().source(), ThreadId(6));

        let mut remote = proxy(5);
        remote.set_channel(Channel::new(Cookie(300), ThreadId::UNKNOWN, ThreadId::UNKNOWN));
        list.insert_or_find(&remote);
        assert_eq!(list.len(), 2);

        assert!(list.remove(&remote).is_some());
        assert!(list.remove(&remote).is_none());
        assert_eq!(list.len(), 1);
    }
}
