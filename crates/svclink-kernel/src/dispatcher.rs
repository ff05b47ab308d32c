//! Dispatcher threads and event delivery.
//!
//! A dispatcher thread is a single-consumer event queue hosting stubs and
//! proxies. The [`ThreadRegistry`] resolves threads by name or numeric id and
//! posts [`ServiceEvent`]s into them. Events for a thread that is gone are
//! dropped, never queued.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use svclink_types::error::{SvcLinkError, SvcLinkResult};
use svclink_types::{ServiceEvent, ThreadId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Receiving side of an [`EventThread`] queue.
pub type EventReceiver = mpsc::UnboundedReceiver<ServiceEvent>;

/// A thread that accepts posted service events.
pub trait DispatcherThread: Send + Sync {
    fn id(&self) -> ThreadId;

    fn name(&self) -> &str;

    /// Whether the thread still consumes its queue.
    fn is_valid(&self) -> bool;

    /// Post an event. Returns `false` if the thread is gone.
    fn post(&self, event: ServiceEvent) -> bool;
}

/// Dispatcher thread backed by a tokio unbounded channel.
pub struct EventThread {
    id: ThreadId,
    name: String,
    sender: mpsc::UnboundedSender<ServiceEvent>,
}

impl EventThread {
    fn new(id: ThreadId, name: String) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id, name, sender }, receiver)
    }
}

impl DispatcherThread for EventThread {
    fn id(&self) -> ThreadId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        !self.sender.is_closed()
    }

    fn post(&self, event: ServiceEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Registry of live dispatcher threads.
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<dyn DispatcherThread>>,
    names: DashMap<String, ThreadId>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
            names: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh thread id. Ids are never reused.
    pub fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a channel-backed thread under `name`.
    ///
    /// A name held by a thread that stopped consuming its queue is reused;
    /// the stale thread is dropped from the registry.
    pub fn create_thread(
        &self,
        name: &str,
    ) -> SvcLinkResult<(Arc<EventThread>, EventReceiver)> {
        let id = self.next_thread_id();
        let (thread, receiver) = EventThread::new(id, name.to_string());
        let thread = Arc::new(thread);
        self.register(thread.clone())?;
        Ok((thread, receiver))
    }

    /// Register an externally created thread.
    pub fn register(&self, thread: Arc<dyn DispatcherThread>) -> SvcLinkResult<()> {
        let name = thread.name().to_string();
        if name.is_empty() || !thread.id().is_known() {
            return Err(SvcLinkError::InvalidThread(format!(
                "thread '{name}' ({})",
                thread.id()
            )));
        }

        // The name slot stays locked until the thread is in place, so two
        // registrations of one name cannot both succeed.
        let id = thread.id();
        match self.names.entry(name.clone()) {
            Entry::Occupied(mut slot) => {
                let old_id = *slot.get();
                if let Some(existing) = self.find_by_id(old_id) {
                    if existing.is_valid() {
                        return Err(SvcLinkError::ThreadAlreadyExists(name));
                    }
                    debug!(thread = %name, old_id = %old_id, "Replacing stale thread");
                    self.threads.remove(&old_id);
                }
                self.threads.insert(id, thread);
                slot.insert(id);
            }
            Entry::Vacant(slot) => {
                self.threads.insert(id, thread);
                slot.insert(id);
            }
        }
        info!(thread = %name, id = %id, "Dispatcher thread registered");
        Ok(())
    }

    /// Remove a thread. Its queued events stay with its receiver.
    pub fn destroy_thread(&self, id: ThreadId) -> Option<Arc<dyn DispatcherThread>> {
        let (_, thread) = self.threads.remove(&id)?;
        self.names
            .remove_if(thread.name(), |_, mapped| *mapped == id);
        info!(thread = %thread.name(), id = %id, "Dispatcher thread destroyed");
        Some(thread)
    }

    pub fn find_by_id(&self, id: ThreadId) -> Option<Arc<dyn DispatcherThread>> {
        self.threads.get(&id).map(|t| t.value().clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn DispatcherThread>> {
        let id = *self.names.get(name)?;
        self.find_by_id(id)
    }

    /// Id of the live thread named `name`.
    pub fn thread_id(&self, name: &str) -> Option<ThreadId> {
        self.find_by_name(name)
            .filter(|t| t.is_valid())
            .map(|t| t.id())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Post `event` to the thread it targets.
    ///
    /// Returns `false` and drops the event when the target thread is
    /// unknown or no longer valid.
    pub fn deliver(&self, event: ServiceEvent) -> bool {
        let target = event.target_thread();
        let Some(thread) = self.find_by_id(target) else {
            debug!(kind = event.kind(), thread = %target, "Target thread not found, event dropped");
            return false;
        };
        if !thread.is_valid() {
            debug!(kind = event.kind(), thread = %thread.name(), "Target thread stopped, event dropped");
            return false;
        }
        if !thread.post(event) {
            debug!(thread = %thread.name(), "Post failed, event dropped");
            return false;
        }
        true
    }

    /// Create a thread and run `handler` for each of its events on a tokio
    /// task. The task ends when the thread is destroyed and its queue drains.
    pub fn spawn_thread<F>(&self, name: &str, mut handler: F) -> SvcLinkResult<(ThreadId, JoinHandle<()>)>
    where
        F: FnMut(ServiceEvent) + Send + 'static,
    {
        let (thread, mut receiver) = self.create_thread(name)?;
        let id = thread.id();
        // The registry keeps the only sender; dropping this clone lets the
        // task end once the thread is destroyed.
        drop(thread);
        let thread_name = name.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handler(event);
            }
            debug!(thread = %thread_name, "Dispatcher thread loop ended");
        });
        Ok((id, handle))
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svclink_types::event::ResponseEvent;
    use svclink_types::{
        Channel, MessageId, ProxyAddress, ResultType, SequenceNumber, ServiceItem, ServiceType,
        Version,
    };

    fn response_to(source: ThreadId) -> ServiceEvent {
        let mut proxy = ProxyAddress::new(
            ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Local),
            "CalcRole",
            "ui",
        );
        proxy.set_channel(Channel::local(source));
        ServiceEvent::Response(ResponseEvent::new(
            proxy,
            MessageId(1),
            SequenceNumber(1),
            ResultType::Ok,
        ))
    }

    #[test]
    fn test_create_and_find() {
        let registry = ThreadRegistry::new();
        let (thread, _rx) = registry.create_thread("ui").unwrap();
        assert!(thread.id().is_known());
        assert_eq!(registry.find_by_name("ui").unwrap().id(), thread.id());
        assert_eq!(registry.find_by_id(thread.id()).unwrap().name(), "ui");
        assert_eq!(registry.thread_id("ui"), Some(thread.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_live_name_rejected() {
        let registry = ThreadRegistry::new();
        let (_thread, _rx) = registry.create_thread("ui").unwrap();
        assert!(matches!(
            registry.create_thread("ui"),
            Err(SvcLinkError::ThreadAlreadyExists(_))
        ));
    }

    #[test]
    fn test_concurrent_registration_admits_one() {
        let registry = Arc::new(ThreadRegistry::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.create_thread("ui").ok())
            })
            .collect();
        // Receivers stay alive until every attempt is done.
        let created: Vec<_> = workers
            .into_iter()
            .filter_map(|w| w.join().unwrap())
            .collect();

        assert_eq!(created.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.thread_id("ui"), Some(created[0].0.id()));
    }

    #[test]
    fn test_unnamed_thread_rejected() {
        let registry = ThreadRegistry::new();
        let (thread, _rx) = EventThread::new(registry.next_thread_id(), String::new());
        assert!(matches!(
            registry.register(Arc::new(thread)),
            Err(SvcLinkError::InvalidThread(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_name_is_reused() {
        let registry = ThreadRegistry::new();
        let (first, rx) = registry.create_thread("worker").unwrap();
        drop(rx);
        let (second, _rx) = registry.create_thread("worker").unwrap();
        assert_ne!(first.id(), second.id());
        assert!(registry.find_by_id(first.id()).is_none());
        assert_eq!(registry.thread_id("worker"), Some(second.id()));
    }

    #[test]
    fn test_deliver_posts_to_target() {
        let registry = ThreadRegistry::new();
        let (thread, mut rx) = registry.create_thread("ui").unwrap();
        assert!(registry.deliver(response_to(thread.id())));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), "response");
    }

    #[test]
    fn test_deliver_to_missing_thread_is_dropped() {
        let registry = ThreadRegistry::new();
        assert!(!registry.deliver(response_to(ThreadId(42))));

        let (thread, rx) = registry.create_thread("ui").unwrap();
        drop(rx);
        assert!(!registry.deliver(response_to(thread.id())));
    }

    #[test]
    fn test_destroy_thread() {
        let registry = ThreadRegistry::new();
        let (thread, _rx) = registry.create_thread("ui").unwrap();
        assert!(registry.destroy_thread(thread.id()).is_some());
        assert!(registry.find_by_name("ui").is_none());
        assert!(!registry.deliver(response_to(thread.id())));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_thread_runs_handler() {
        let registry = ThreadRegistry::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let (id, handle) = registry
            .spawn_thread("worker", move |event| {
                let _ = tx.send(event.kind());
            })
            .unwrap();
        assert!(registry.deliver(response_to(id)));
        assert_eq!(seen.recv().await, Some("response"));

        registry.destroy_thread(id);
        handle.await.unwrap();
    }
}
