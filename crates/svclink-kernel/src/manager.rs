//! The service manager: the single writer of the [`ServerList`].
//!
//! Registration requests from any thread, and from the router link, are
//! queued and applied one at a time on a dedicated tokio task. Each applied
//! request may post connection events to the affected stubs and proxies.
//! Callers never wait for the result; they observe it through those events.
//!
//! Connection events are only posted to local endpoints. A peer process runs
//! its own manager and notifies its own endpoints.

use crate::bridge::{RemoteServiceProvider, RouterClient, ServiceConnector};
use crate::dispatcher::ThreadRegistry;
use crate::error::{KernelError, KernelResult};
use crate::registry::{ClientInfo, RegistrySnapshot, ServerInfo, ServerList};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use svclink_types::config::ManagerConfig;
use svclink_types::error::{SvcLinkError, SvcLinkResult};
use svclink_types::event::{ProxyConnectionEvent, ServiceEvent, StubConnectionEvent};
use svclink_types::{
    Channel, ConnectionState, Cookie, DisconnectReason, ProxyAddress, StubAddress,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum ManagerCommand {
    RegisterServer(StubAddress),
    UnregisterServer {
        stub: StubAddress,
        reason: DisconnectReason,
        cookie: Cookie,
    },
    RegisterClient(ProxyAddress),
    UnregisterClient {
        proxy: ProxyAddress,
        reason: DisconnectReason,
        cookie: Cookie,
    },
    RecreateThread(String),
    RouterStarted(Channel),
    RouterStopped {
        channel: Channel,
        reason: DisconnectReason,
    },
    Flush(oneshot::Sender<()>),
}

/// State shared between the manager handle and its task.
struct ManagerCore {
    threads: Arc<ThreadRegistry>,
    servers: RwLock<ServerList>,
    router: RwLock<Option<Arc<dyn RouterClient>>>,
}

impl ManagerCore {
    fn servers(&self) -> RwLockReadGuard<'_, ServerList> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn servers_mut(&self) -> RwLockWriteGuard<'_, ServerList> {
        self.servers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn router(&self) -> Option<Arc<dyn RouterClient>> {
        self.router.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn process(&self, command: ManagerCommand) {
        match command {
            ManagerCommand::RegisterServer(stub) => self.register_server(stub),
            ManagerCommand::UnregisterServer {
                stub,
                reason,
                cookie,
            } => self.unregister_server(stub, reason, cookie),
            ManagerCommand::RegisterClient(proxy) => self.register_client(proxy),
            ManagerCommand::UnregisterClient {
                proxy,
                reason,
                cookie,
            } => self.unregister_client(proxy, reason, cookie),
            ManagerCommand::RecreateThread(name) => self.recreate_thread(&name),
            ManagerCommand::RouterStarted(channel) => self.router_started(channel),
            ManagerCommand::RouterStopped { channel, reason } => {
                self.router_stopped(channel, reason)
            }
            ManagerCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn register_server(&self, stub: StubAddress) {
        let registered = self.servers_mut().register_server(&stub);
        let Some((server, clients)) = registered else {
            return;
        };

        if stub.is_local() && stub.is_public() {
            self.announce(|router| router.register_stub(&stub));
        }

        for client in clients.iter().filter(|c| c.is_connected()) {
            self.notify_proxy(server.stub(), client.proxy(), ConnectionState::Connected, DisconnectReason::Undefined);
            self.notify_stub(server.stub(), client.proxy(), ConnectionState::Connected, DisconnectReason::Undefined);
        }
    }

    fn unregister_server(&self, stub: StubAddress, reason: DisconnectReason, cookie: Cookie) {
        let unregistered = self.servers_mut().unregister_server(&stub, cookie);
        let Some((gone, affected)) = unregistered else {
            return;
        };

        if gone.stub().is_local() && gone.stub().is_public() {
            self.announce(|router| router.unregister_stub(gone.stub(), reason));
        }

        for client in &affected {
            self.notify_proxy(gone.stub(), client.proxy(), ConnectionState::Pending, reason);
        }
    }

    fn register_client(&self, proxy: ProxyAddress) {
        let registered = self.servers_mut().register_client(&proxy);
        let Some((server, client)) = registered else {
            return;
        };

        if proxy.is_local() && proxy.is_public() {
            self.announce(|router| router.register_proxy(&proxy));
        }

        if client.is_connected() {
            self.notify_proxy(server.stub(), client.proxy(), ConnectionState::Connected, DisconnectReason::Undefined);
            self.notify_stub(server.stub(), client.proxy(), ConnectionState::Connected, DisconnectReason::Undefined);
        }
    }

    fn unregister_client(&self, proxy: ProxyAddress, reason: DisconnectReason, cookie: Cookie) {
        let unregistered = self.servers_mut().unregister_client(&proxy, cookie);
        let Some((server, removed)) = unregistered else {
            return;
        };

        if removed.proxy().is_local() && removed.proxy().is_public() {
            self.announce(|router| router.unregister_proxy(removed.proxy(), reason));
        }

        if removed.is_connected() {
            self.notify_stub(server.stub(), removed.proxy(), ConnectionState::Pending, reason);
        }
    }

    fn recreate_thread(&self, thread_name: &str) {
        let (stubs, proxies) = self.servers().addresses_on_thread(thread_name);
        match self.threads.thread_id(thread_name) {
            Some(id) => {
                info!(
                    thread = %thread_name,
                    id = %id,
                    stubs = stubs.len(),
                    proxies = proxies.len(),
                    "Re-registering services of recreated thread"
                );
                // Stubs first so proxies on the same thread see the new source.
                for mut stub in stubs {
                    stub.set_source(id);
                    self.register_server(stub);
                }
                for mut proxy in proxies {
                    proxy.set_source(id);
                    self.register_client(proxy);
                }
            }
            None => {
                warn!(
                    thread = %thread_name,
                    stubs = stubs.len(),
                    proxies = proxies.len(),
                    "Thread is gone, unregistering its services"
                );
                for proxy in proxies {
                    let cookie = proxy.cookie();
                    self.unregister_client(proxy, DisconnectReason::ThreadDestroyed, cookie);
                }
                for stub in stubs {
                    let cookie = stub.cookie();
                    self.unregister_server(stub, DisconnectReason::ThreadDestroyed, cookie);
                }
            }
        }
    }

    fn router_started(&self, channel: Channel) {
        let (stubs, proxies) = self.servers().service_list(Cookie::LOCAL);
        let Some(router) = self.router() else {
            warn!(channel = %channel, "Router link started without a router client");
            return;
        };

        let stubs: Vec<_> = stubs.into_iter().filter(|s| s.is_public()).collect();
        let proxies: Vec<_> = proxies.into_iter().filter(|p| p.is_public()).collect();
        for stub in &stubs {
            router.register_stub(stub);
        }
        for proxy in &proxies {
            router.register_proxy(proxy);
        }
        info!(
            channel = %channel,
            stubs = stubs.len(),
            proxies = proxies.len(),
            "Router link started, local public services announced"
        );
    }

    fn router_stopped(&self, channel: Channel, reason: DisconnectReason) {
        let (stubs, proxies) = self.servers().remote_entries(channel.cookie);
        info!(
            channel = %channel,
            stubs = stubs.len(),
            proxies = proxies.len(),
            "Router link stopped, removing remote services"
        );
        for proxy in proxies {
            let cookie = proxy.cookie();
            self.unregister_client(proxy, reason, cookie);
        }
        for stub in stubs {
            let cookie = stub.cookie();
            self.unregister_server(stub, reason, cookie);
        }
    }

    fn announce(&self, action: impl FnOnce(&dyn RouterClient) -> bool) {
        let Some(router) = self.router() else {
            return;
        };
        if !router.is_connected() {
            debug!("Router link down, announcement skipped");
            return;
        }
        if !action(router.as_ref()) {
            debug!("Router announcement failed");
        }
    }

    fn notify_proxy(
        &self,
        stub: &StubAddress,
        proxy: &ProxyAddress,
        state: ConnectionState,
        reason: DisconnectReason,
    ) {
        if proxy.is_remote() {
            return;
        }
        debug!(proxy = %proxy, stub = %stub, state = ?state, reason = ?reason, "Notifying proxy");
        self.send_event(ServiceEvent::ProxyConnection(ProxyConnectionEvent {
            proxy: proxy.clone(),
            stub: stub.clone(),
            state,
            reason,
        }));
    }

    fn notify_stub(
        &self,
        stub: &StubAddress,
        proxy: &ProxyAddress,
        state: ConnectionState,
        reason: DisconnectReason,
    ) {
        if stub.is_remote() {
            return;
        }
        debug!(stub = %stub, proxy = %proxy, state = ?state, reason = ?reason, "Notifying stub");
        self.send_event(ServiceEvent::StubConnection(StubConnectionEvent {
            stub: stub.clone(),
            proxy: proxy.clone(),
            state,
            reason,
        }));
    }

    fn send_event(&self, event: ServiceEvent) -> bool {
        if !event.is_remote_target() {
            return self.threads.deliver(event);
        }
        match self.router() {
            Some(router) if router.is_connected() => router.relay_event(event),
            _ => {
                debug!(kind = event.kind(), cookie = %event.target_cookie(), "No router link, remote event dropped");
                false
            }
        }
    }
}

async fn run(
    core: Arc<ManagerCore>,
    mut commands: mpsc::UnboundedReceiver<ManagerCommand>,
    queued: Arc<AtomicUsize>,
) {
    while let Some(command) = commands.recv().await {
        queued.fetch_sub(1, Ordering::Relaxed);
        core.process(command);
    }
    debug!("Service manager queue drained");
}

/// Removal scope of an unregistration: the address's own connection, or
/// everything when the address carries no cookie.
fn scope_of(cookie: Cookie) -> Cookie {
    if cookie.is_known() {
        cookie
    } else {
        Cookie::ANY
    }
}

/// Handle to the service manager actor.
pub struct ServiceManager {
    core: Arc<ManagerCore>,
    config: ManagerConfig,
    sender: RwLock<Option<mpsc::UnboundedSender<ManagerCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
}

impl ServiceManager {
    pub fn new(threads: Arc<ThreadRegistry>, config: ManagerConfig) -> Self {
        Self {
            core: Arc::new(ManagerCore {
                threads,
                servers: RwLock::new(ServerList::new()),
                router: RwLock::new(None),
            }),
            config,
            sender: RwLock::new(None),
            task: Mutex::new(None),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.core.threads
    }

    /// Attach (or detach) the router transport.
    pub fn set_router_client(&self, router: Option<Arc<dyn RouterClient>>) {
        *self.core.router.write().unwrap_or_else(|e| e.into_inner()) = router;
    }

    /// Spawn the manager task. Must be called within a tokio runtime.
    pub fn start(&self) -> SvcLinkResult<()> {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Err(SvcLinkError::ManagerAlreadyRunning);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *task = Some(tokio::spawn(run(self.core.clone(), rx, self.queued.clone())));
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        info!("Service manager started");
        Ok(())
    }

    /// Close the queue and wait for queued requests to be applied.
    ///
    /// The wait is bounded by `shutdown_timeout_ms` (unbounded when `0`).
    /// On timeout the task is aborted, the remaining requests are lost and
    /// [`KernelError::DrainTimeout`] is returned.
    pub async fn stop(&self) -> KernelResult<()> {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return Err(SvcLinkError::ManagerNotRunning.into());
        };
        self.sender.write().unwrap_or_else(|e| e.into_inner()).take();

        let timeout_ms = self.config.shutdown_timeout_ms;
        let abort = handle.abort_handle();
        let joined = if timeout_ms == 0 {
            Ok(handle.await)
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await
        };
        match joined {
            Ok(Ok(())) => {
                info!("Service manager stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Service manager task failed");
                Err(KernelError::ManagerTask(e.to_string()))
            }
            Err(_) => {
                let pending = self.queued_len();
                warn!(timeout_ms, pending, "Service manager did not drain in time, aborting");
                abort.abort();
                Err(KernelError::DrainTimeout {
                    timeout_ms,
                    pending,
                })
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Requests queued but not yet applied.
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn enqueue(&self, command: ManagerCommand) -> SvcLinkResult<()> {
        let sender = self.sender.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = sender.as_ref() else {
            return Err(SvcLinkError::ManagerNotRunning);
        };
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if tx.send(command).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(SvcLinkError::ShuttingDown);
        }
        if depth == self.config.queue_warn_depth {
            warn!(depth, "Service manager queue is backing up");
        }
        Ok(())
    }

    pub fn request_register_server(&self, stub: StubAddress) -> SvcLinkResult<()> {
        self.enqueue(ManagerCommand::RegisterServer(stub))
    }

    pub fn request_unregister_server(
        &self,
        stub: StubAddress,
        reason: DisconnectReason,
    ) -> SvcLinkResult<()> {
        let cookie = scope_of(stub.cookie());
        self.enqueue(ManagerCommand::UnregisterServer {
            stub,
            reason,
            cookie,
        })
    }

    pub fn request_register_client(&self, proxy: ProxyAddress) -> SvcLinkResult<()> {
        self.enqueue(ManagerCommand::RegisterClient(proxy))
    }

    pub fn request_unregister_client(
        &self,
        proxy: ProxyAddress,
        reason: DisconnectReason,
    ) -> SvcLinkResult<()> {
        let cookie = scope_of(proxy.cookie());
        self.enqueue(ManagerCommand::UnregisterClient {
            proxy,
            reason,
            cookie,
        })
    }

    /// Re-synchronize the services of `thread_name` after the thread was
    /// restarted or destroyed.
    pub fn request_recreate_thread(&self, thread_name: impl Into<String>) -> SvcLinkResult<()> {
        self.enqueue(ManagerCommand::RecreateThread(thread_name.into()))
    }

    /// Resolves once every request queued before it has been applied.
    pub async fn flush(&self) -> SvcLinkResult<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(ManagerCommand::Flush(tx))?;
        rx.await.map_err(|_| SvcLinkError::ShuttingDown)
    }

    /// Post an event to a local thread or relay it to a remote process.
    pub fn deliver_event(&self, event: ServiceEvent) -> bool {
        self.core.send_event(event)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.core.servers().snapshot()
    }

    pub fn server_state(&self, stub: &StubAddress) -> ConnectionState {
        self.core.servers().server_state(stub)
    }

    pub fn is_server_registered(&self, stub: &StubAddress) -> bool {
        self.core.servers().is_server_registered(stub)
    }

    pub fn client_state(&self, proxy: &ProxyAddress) -> ConnectionState {
        self.core
            .servers()
            .find_client(proxy)
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Unknown)
    }

    pub fn client_list(&self, stub: &StubAddress) -> Vec<ClientInfo> {
        self.core
            .servers()
            .client_list(stub)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    pub fn find_client_server(&self, proxy: &ProxyAddress) -> Option<ServerInfo> {
        self.core.servers().find_client_server(proxy).cloned()
    }

    /// Number of service identities in the registry.
    pub fn service_count(&self) -> usize {
        self.core.servers().len()
    }

    fn log_rejected(&self, operation: &'static str, result: SvcLinkResult<()>) {
        if let Err(e) = result {
            warn!(operation, error = %e, "Service manager request rejected");
        }
    }
}

impl RemoteServiceProvider for ServiceManager {
    fn service_list(&self, cookie: Cookie) -> (Vec<StubAddress>, Vec<ProxyAddress>) {
        self.core.servers().service_list(cookie)
    }

    fn register_remote_stub(&self, stub: StubAddress) {
        if !stub.is_remote() {
            warn!(stub = %stub, cookie = %stub.cookie(), "Remote stub without a peer cookie ignored");
            return;
        }
        self.log_rejected("register_remote_stub", self.request_register_server(stub));
    }

    fn register_remote_proxy(&self, proxy: ProxyAddress) {
        if !proxy.is_remote() {
            warn!(proxy = %proxy, cookie = %proxy.cookie(), "Remote proxy without a peer cookie ignored");
            return;
        }
        self.log_rejected("register_remote_proxy", self.request_register_client(proxy));
    }

    fn unregister_remote_stub(&self, stub: StubAddress, reason: DisconnectReason, cookie: Cookie) {
        let result = self.enqueue(ManagerCommand::UnregisterServer {
            stub,
            reason,
            cookie,
        });
        self.log_rejected("unregister_remote_stub", result);
    }

    fn unregister_remote_proxy(&self, proxy: ProxyAddress, reason: DisconnectReason, cookie: Cookie) {
        let result = self.enqueue(ManagerCommand::UnregisterClient {
            proxy,
            reason,
            cookie,
        });
        self.log_rejected("unregister_remote_proxy", result);
    }

    fn remote_service_started(&self, channel: Channel) {
        self.log_rejected(
            "remote_service_started",
            self.enqueue(ManagerCommand::RouterStarted(channel)),
        );
    }

    fn remote_service_stopped(&self, channel: Channel) {
        self.log_rejected(
            "remote_service_stopped",
            self.enqueue(ManagerCommand::RouterStopped {
                channel,
                reason: DisconnectReason::RouterDisconnected,
            }),
        );
    }

    fn remote_service_connection_lost(&self, channel: Channel) {
        warn!(channel = %channel, "Router connection lost");
        self.log_rejected(
            "remote_service_connection_lost",
            self.enqueue(ManagerCommand::RouterStopped {
                channel,
                reason: DisconnectReason::RouterDisconnected,
            }),
        );
    }
}

impl ServiceConnector for ServiceManager {
    fn register_proxy(&self, proxy: ProxyAddress) {
        self.log_rejected("register_proxy", self.request_register_client(proxy));
    }

    fn unregister_proxy(&self, proxy: ProxyAddress, reason: DisconnectReason) {
        self.log_rejected(
            "unregister_proxy",
            self.request_unregister_client(proxy, reason),
        );
    }

    fn send_event(&self, event: ServiceEvent) -> bool {
        self.deliver_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherThread;
    use svclink_types::{ServiceItem, ServiceType, ThreadId, Version};

    fn manager() -> ServiceManager {
        ServiceManager::new(Arc::new(ThreadRegistry::new()), ManagerConfig::default())
    }

    /// A thread whose queue stalls the poster.
    struct StalledThread {
        id: ThreadId,
    }

    impl DispatcherThread for StalledThread {
        fn id(&self) -> ThreadId {
            self.id
        }

        fn name(&self) -> &str {
            "worker"
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn post(&self, _event: ServiceEvent) -> bool {
            std::thread::sleep(Duration::from_millis(300));
            true
        }
    }

    fn stub_on(thread: ThreadId) -> StubAddress {
        let mut stub = StubAddress::new(
            ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Local),
            "CalcRole",
            "worker",
        );
        stub.set_channel(Channel::local(thread));
        stub
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = manager();
        manager.start().unwrap();
        assert!(matches!(
            manager.start(),
            Err(SvcLinkError::ManagerAlreadyRunning)
        ));
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_requests_rejected_when_stopped() {
        let manager = manager();
        assert!(matches!(
            manager.request_register_server(stub_on(ThreadId(1))),
            Err(SvcLinkError::ManagerNotRunning)
        ));
        assert!(matches!(
            manager.stop().await,
            Err(KernelError::SvcLink(SvcLinkError::ManagerNotRunning))
        ));
    }

    #[tokio::test]
    async fn test_flush_applies_earlier_requests() {
        let manager = manager();
        manager.start().unwrap();
        manager.request_register_server(stub_on(ThreadId(1))).unwrap();
        manager.flush().await.unwrap();
        assert!(manager.is_server_registered(&stub_on(ThreadId(1))));
        assert_eq!(manager.queued_len(), 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_queue() {
        let manager = manager();
        manager.start().unwrap();
        manager.request_register_server(stub_on(ThreadId(1))).unwrap();
        manager
            .request_unregister_server(stub_on(ThreadId(1)), DisconnectReason::ProviderDisconnected)
            .unwrap();
        manager.request_register_server(stub_on(ThreadId(2))).unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.server_state(&stub_on(ThreadId(2))), ConnectionState::Connected);
        assert_eq!(manager.service_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_times_out_on_stalled_queue() {
        let threads = Arc::new(ThreadRegistry::new());
        let worker = threads.next_thread_id();
        threads.register(Arc::new(StalledThread { id: worker })).unwrap();
        let config = ManagerConfig {
            shutdown_timeout_ms: 20,
            ..ManagerConfig::default()
        };
        let manager = ServiceManager::new(threads, config);
        manager.start().unwrap();

        manager.request_register_server(stub_on(worker)).unwrap();
        let mut proxy = ProxyAddress::new(
            ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Local),
            "CalcRole",
            "ui",
        );
        proxy.set_channel(Channel::local(ThreadId(77)));
        // Connecting the client posts to the stalled worker.
        manager.request_register_client(proxy).unwrap();

        assert!(matches!(
            manager.stop().await,
            Err(KernelError::DrainTimeout { timeout_ms: 20, .. })
        ));
        assert!(!manager.is_running());
    }

    #[test]
    fn test_scope_of_unknown_cookie_is_any() {
        assert_eq!(scope_of(Cookie::UNKNOWN), Cookie::ANY);
        assert_eq!(scope_of(Cookie(300)), Cookie(300));
    }
}
