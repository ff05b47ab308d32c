use super::info::{ClientInfo, ClientList, ServerInfo};
use serde::Serialize;
use std::collections::HashMap;
use svclink_types::{
    ConnectionState, Cookie, ProxyAddress, ServiceAddress, ServiceType, StubAddress,
};
use tracing::{debug, info, warn};

/// Identity under which providers and consumers meet: versions may differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    name: String,
    service_type: ServiceType,
    role: String,
}

impl ServiceKey {
    fn of(service: &ServiceAddress) -> Self {
        Self {
            name: service.service_name().to_string(),
            service_type: service.service_type(),
            role: service.role_name().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ServerEntry {
    server: ServerInfo,
    clients: ClientList,
}

/// Registry of providers and their consumers.
///
/// Each service identity (name, type, role) has at most one entry, and each
/// consumer appears in exactly one client list.
#[derive(Debug, Default)]
pub struct ServerList {
    entries: HashMap<ServiceKey, ServerEntry>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider and connect every compatible waiting consumer.
    ///
    /// Returns the server entry and its full client list, or `None` when
    /// the stub has no usable identity or channel.
    pub fn register_server(&mut self, stub: &StubAddress) -> Option<(ServerInfo, Vec<ClientInfo>)> {
        if !stub.is_valid() {
            warn!(stub = %stub, channel = %stub.channel(), "Refusing to register invalid stub");
            return None;
        }

        let entry = self
            .entries
            .entry(ServiceKey::of(stub.service()))
            .or_insert_with(|| ServerEntry {
                server: ServerInfo::new(stub.clone()),
                clients: ClientList::new(),
            });

        let previous = entry.server.stub();
        if entry.server.is_registered()
            && (previous.cookie() != stub.cookie() || previous.thread_name() != stub.thread_name())
        {
            warn!(
                stub = %stub,
                old = %previous.channel(),
                new = %stub.channel(),
                "Provider registered twice, replacing previous registration"
            );
        }
        entry.server.register(stub);

        for client in entry.clients.iter_mut() {
            if entry.server.can_serve(client.proxy()) {
                client.connect(stub);
            } else if client.is_connected() {
                client.disconnect();
            }
        }

        info!(stub = %stub, clients = entry.clients.len(), "Server registered");
        Some((entry.server.clone(), entry.clients.to_vec()))
    }

    /// Unregister a provider. Connected clients revert to pending and are
    /// returned. The entry is evicted when no client remains.
    ///
    /// A `cookie` other than [`Cookie::ANY`] only removes a provider that was
    /// registered over that connection. A stub that was replaced by a newer
    /// registration (other thread name or source) cannot remove its successor.
    pub fn unregister_server(
        &mut self,
        stub: &StubAddress,
        cookie: Cookie,
    ) -> Option<(ServerInfo, Vec<ClientInfo>)> {
        let key = ServiceKey::of(stub.service());
        let entry = self.entries.get_mut(&key)?;
        if !entry.server.is_registered() || !entry.server.stub().cookie().matches(cookie) {
            debug!(stub = %stub, cookie = %cookie, "Unregister ignored, provider not registered here");
            return None;
        }
        if !is_same_provider(entry.server.stub(), stub) {
            warn!(
                stub = %stub,
                live = %entry.server.stub().channel(),
                stale = %stub.channel(),
                "Unregister ignored, provider was replaced by another registration"
            );
            return None;
        }

        let gone = ServerInfo::departed(entry.server.stub().clone());
        entry.server.unregister();
        let affected: Vec<ClientInfo> = entry
            .clients
            .iter_mut()
            .filter_map(|client| client.disconnect().then(|| client.clone()))
            .collect();

        if entry.clients.is_empty() {
            self.entries.remove(&key);
            debug!(stub = %stub, "Server entry evicted");
        }

        info!(stub = %stub, affected = affected.len(), "Server unregistered");
        Some((gone, affected))
    }

    /// Register a consumer, creating a placeholder provider entry if needed.
    pub fn register_client(&mut self, proxy: &ProxyAddress) -> Option<(ServerInfo, ClientInfo)> {
        if !proxy.is_valid() {
            warn!(proxy = %proxy, channel = %proxy.channel(), "Refusing to register invalid proxy");
            return None;
        }

        let entry = self
            .entries
            .entry(ServiceKey::of(proxy.service()))
            .or_insert_with(|| ServerEntry {
                server: ServerInfo::placeholder(proxy),
                clients: ClientList::new(),
            });

        let client = entry.clients.insert_or_find(proxy);
        if entry.server.can_serve(client.proxy()) {
            client.connect(entry.server.stub());
        } else {
            client.disconnect();
            if entry.server.is_registered() {
                debug!(
                    proxy = %proxy,
                    provider = %entry.server.stub().version(),
                    "Registered provider is not compatible, client stays pending"
                );
            }
        }

        debug!(proxy = %proxy, state = ?client.state(), "Client registered");
        Some((entry.server.clone(), client.clone()))
    }

    /// Remove a consumer. The entry is evicted when its client list becomes
    /// empty and no provider is registered.
    pub fn unregister_client(
        &mut self,
        proxy: &ProxyAddress,
        cookie: Cookie,
    ) -> Option<(ServerInfo, ClientInfo)> {
        let key = ServiceKey::of(proxy.service());
        let entry = self.entries.get_mut(&key)?;
        let matches_scope = entry
            .clients
            .find(proxy)
            .is_some_and(|c| c.proxy().cookie().matches(cookie));
        if !matches_scope {
            debug!(proxy = %proxy, cookie = %cookie, "Unregister ignored, client not found");
            return None;
        }
        let removed = entry.clients.remove(proxy)?;
        let server = entry.server.clone();

        if entry.clients.is_empty() && !entry.server.is_registered() {
            self.entries.remove(&key);
            debug!(proxy = %proxy, "Placeholder server entry evicted");
        }

        debug!(proxy = %proxy, "Client unregistered");
        Some((server, removed))
    }

    pub fn find_server(&self, stub: &StubAddress) -> Option<&ServerInfo> {
        self.entries
            .get(&ServiceKey::of(stub.service()))
            .map(|e| &e.server)
    }

    /// The provider entry a registered consumer belongs to.
    ///
    /// A registered provider is only returned when it can serve `proxy`; a
    /// placeholder matches by identity.
    pub fn find_client_server(&self, proxy: &ProxyAddress) -> Option<&ServerInfo> {
        let entry = self.entries.get(&ServiceKey::of(proxy.service()))?;
        entry.clients.find(proxy)?;
        if entry.server.is_registered() && !entry.server.can_serve(proxy) {
            return None;
        }
        Some(&entry.server)
    }

    pub fn server_state(&self, stub: &StubAddress) -> ConnectionState {
        self.find_server(stub)
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Unknown)
    }

    pub fn client_list(&self, stub: &StubAddress) -> Option<&ClientList> {
        self.entries
            .get(&ServiceKey::of(stub.service()))
            .map(|e| &e.clients)
    }

    /// The registry entry of `proxy`, if any.
    pub fn find_client(&self, proxy: &ProxyAddress) -> Option<&ClientInfo> {
        self.entries
            .get(&ServiceKey::of(proxy.service()))?
            .clients
            .find(proxy)
    }

    pub fn is_server_registered(&self, stub: &StubAddress) -> bool {
        self.find_server(stub).is_some_and(|s| s.is_registered())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered stubs and known proxies whose cookie falls in `cookie`.
    pub fn service_list(&self, cookie: Cookie) -> (Vec<StubAddress>, Vec<ProxyAddress>) {
        self.collect(|cookie_of| cookie_of.matches(cookie))
    }

    /// Remote stubs and proxies announced over `cookie`.
    ///
    /// [`Cookie::ROUTER`] and [`Cookie::ANY`] select every remote entry.
    pub fn remote_entries(&self, cookie: Cookie) -> (Vec<StubAddress>, Vec<ProxyAddress>) {
        let all = cookie == Cookie::ROUTER || cookie == Cookie::ANY;
        self.collect(|cookie_of| cookie_of.is_remote() && (all || cookie_of == cookie))
    }

    /// Local stubs and proxies hosted by the thread named `thread_name`.
    pub fn addresses_on_thread(&self, thread_name: &str) -> (Vec<StubAddress>, Vec<ProxyAddress>) {
        let mut stubs = Vec::new();
        let mut proxies = Vec::new();
        for entry in self.entries.values() {
            let stub = entry.server.stub();
            if entry.server.is_registered() && !stub.is_remote() && stub.thread_name() == thread_name {
                stubs.push(stub.clone());
            }
            proxies.extend(
                entry
                    .clients
                    .iter()
                    .map(|c| c.proxy())
                    .filter(|p| !p.is_remote() && p.thread_name() == thread_name)
                    .cloned(),
            );
        }
        (stubs, proxies)
    }

    fn collect(&self, keep: impl Fn(Cookie) -> bool) -> (Vec<StubAddress>, Vec<ProxyAddress>) {
        let mut stubs = Vec::new();
        let mut proxies = Vec::new();
        for entry in self.entries.values() {
            if entry.server.is_registered() && keep(entry.server.stub().cookie()) {
                stubs.push(entry.server.stub().clone());
            }
            proxies.extend(
                entry
                    .clients
                    .iter()
                    .map(|c| c.proxy())
                    .filter(|p| keep(p.cookie()))
                    .cloned(),
            );
        }
        (stubs, proxies)
    }

    /// Point-in-time copy of the registry for diagnostics.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut servers: Vec<ServerSnapshot> = self
            .entries
            .values()
            .map(|entry| ServerSnapshot {
                stub: entry.server.stub().to_path(),
                thread: entry.server.stub().thread_name().to_string(),
                cookie: entry.server.stub().cookie(),
                state: entry.server.state(),
                clients: entry
                    .clients
                    .iter()
                    .map(|c| ClientSnapshot {
                        proxy: c.proxy().to_path(),
                        state: c.state(),
                    })
                    .collect(),
            })
            .collect();
        servers.sort_by(|a, b| a.stub.cmp(&b.stub));
        RegistrySnapshot { servers }
    }
}

/// Whether `caller` names the registration held in `live`. An unknown
/// source on either side (remote stubs) compares by thread name only.
fn is_same_provider(live: &StubAddress, caller: &StubAddress) -> bool {
    if live.thread_name() != caller.thread_name() {
        return false;
    }
    let (live, caller) = (live.source(), caller.source());
    !live.is_known() || !caller.is_known() || live == caller
}

/// Serializable view of a [`ServerList`].
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub servers: Vec<ServerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub stub: String,
    pub thread: String,
    pub cookie: Cookie,
    pub state: ConnectionState,
    pub clients: Vec<ClientSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub proxy: String,
    pub state: ConnectionState,
}
