//! End-to-end tests of proxies running against a booted kernel.
//!
//! The stub side is played by the test: it reads the worker thread's queue
//! and answers through the service manager. Proxy-side events are pumped
//! from the ui thread's queue into the proxy registry.

use std::sync::{Arc, Mutex};
use svclink_kernel::{DispatcherThread, EventReceiver, EventThread, ServiceConnector, SvcLinkKernel};
use svclink_proxy::{
    ConsumerError, ConsumerId, InterfaceTable, ProxyConsumer, ProxyRegistry, ProxyResponse,
};
use svclink_types::config::KernelConfig;
use svclink_types::event::{ResponseEvent, ServiceEvent};
use svclink_types::{
    Channel, ConnectionState, DisconnectReason, MessageId, NotifyRequest, ProxyAddress,
    ResultType, SequenceNumber, ServiceItem, ServiceType, StubAddress, Version,
};

const REQUEST_COMPUTE: MessageId = MessageId(0x0001);
const RESPONSE_COMPUTE: MessageId = MessageId(0x8001);
const ATTR_X: MessageId = MessageId(0x9001);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    responses: Mutex<Vec<ProxyResponse>>,
    states: Mutex<Vec<ConnectionState>>,
}

impl ProxyConsumer for Recorder {
    fn on_connection(
        &self,
        _proxy: &ProxyAddress,
        state: ConnectionState,
    ) -> Result<(), ConsumerError> {
        self.states.lock().unwrap().push(state);
        Ok(())
    }

    fn on_response(&self, response: &ProxyResponse) -> Result<(), ConsumerError> {
        self.responses.lock().unwrap().push(response.clone());
        Ok(())
    }
}

fn calc_item() -> ServiceItem {
    ServiceItem::new("Calc", Version::new(1, 0, 0), ServiceType::Local)
}

fn calc_interface() -> Arc<InterfaceTable> {
    Arc::new(
        InterfaceTable::new()
            .request(REQUEST_COMPUTE, Some(RESPONSE_COMPUTE))
            .attribute(ATTR_X),
    )
}

fn stub_on(thread: &EventThread) -> StubAddress {
    let mut stub = StubAddress::new(calc_item(), "CalcRole", thread.name());
    stub.set_channel(Channel::local(thread.id()));
    stub
}

fn proxy_on(thread: &EventThread) -> ProxyAddress {
    let mut proxy = ProxyAddress::new(calc_item(), "CalcRole", thread.name());
    proxy.set_channel(Channel::local(thread.id()));
    proxy
}

fn drain(rx: &mut EventReceiver) -> Vec<ServiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Feed every queued ui event to the proxies.
fn pump(rx: &mut EventReceiver, registry: &ProxyRegistry) -> usize {
    drain(rx)
        .into_iter()
        .filter(|event| registry.dispatch(event.clone()))
        .count()
}

struct Fixture {
    kernel: SvcLinkKernel,
    registry: ProxyRegistry,
    worker: Arc<EventThread>,
    worker_rx: EventReceiver,
    ui: Arc<EventThread>,
    ui_rx: EventReceiver,
}

fn fixture() -> Fixture {
    let kernel = SvcLinkKernel::boot_with_config(KernelConfig::default()).unwrap();
    let registry = ProxyRegistry::new(kernel.manager.clone() as Arc<dyn ServiceConnector>);
    let (worker, worker_rx) = kernel.threads.create_thread("worker").unwrap();
    let (ui, ui_rx) = kernel.threads.create_thread("ui").unwrap();
    Fixture {
        kernel,
        registry,
        worker,
        worker_rx,
        ui,
        ui_rx,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_round_trip() {
    let mut f = fixture();
    f.kernel.manager.request_register_server(stub_on(&f.worker)).unwrap();

    let consumer = Arc::new(Recorder::default());
    let proxy = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    proxy.add_consumer(ConsumerId(1), consumer.clone());
    f.kernel.manager.flush().await.unwrap();

    assert_eq!(pump(&mut f.ui_rx, &f.registry), 1);
    assert!(proxy.is_connected());
    assert_eq!(*consumer.states.lock().unwrap(), vec![ConnectionState::Connected]);
    drain(&mut f.worker_rx);

    let seq = proxy.send_request(REQUEST_COMPUTE, ConsumerId(1), vec![6, 7]);
    let request = match drain(&mut f.worker_rx).pop() {
        Some(ServiceEvent::Request(e)) => e,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(request.sequence_nr, seq);
    assert_eq!(request.message_id, REQUEST_COMPUTE);

    let answer = ResponseEvent::new(request.proxy, RESPONSE_COMPUTE, request.sequence_nr, ResultType::Ok)
        .with_payload(vec![13]);
    assert!(f.kernel.manager.deliver_event(ServiceEvent::Response(answer)));
    assert_eq!(pump(&mut f.ui_rx, &f.registry), 1);

    let responses = consumer.responses.lock().unwrap().clone();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload, vec![13]);
    assert_eq!(responses[0].sequence_nr, seq);
    assert_eq!(proxy.listener_count(), 0);

    f.kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_before_connection_is_undelivered() {
    let mut f = fixture();
    let consumer = Arc::new(Recorder::default());
    let proxy = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    proxy.add_consumer(ConsumerId(1), consumer.clone());
    f.kernel.manager.flush().await.unwrap();
    assert_eq!(proxy.state(), ConnectionState::Pending);

    proxy.send_request(REQUEST_COMPUTE, ConsumerId(1), Vec::new());

    let responses = consumer.responses.lock().unwrap().clone();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message_id, RESPONSE_COMPUTE);
    assert_eq!(responses[0].result, ResultType::MessageUndelivered);
    assert!(drain(&mut f.worker_rx).is_empty());
    assert_eq!(pump(&mut f.ui_rx, &f.registry), 0);

    f.kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attribute_subscription_shared_by_consumers() {
    let mut f = fixture();
    f.kernel.manager.request_register_server(stub_on(&f.worker)).unwrap();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let proxy = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    proxy.add_consumer(ConsumerId(1), first.clone());
    proxy.add_consumer(ConsumerId(2), second.clone());
    f.kernel.manager.flush().await.unwrap();
    pump(&mut f.ui_rx, &f.registry);
    drain(&mut f.worker_rx);

    assert!(proxy.set_notification(ATTR_X, ConsumerId(1), false));
    let start = match drain(&mut f.worker_rx).pop() {
        Some(ServiceEvent::NotifyRequest(e)) => e,
        other => panic!("unexpected event: {other:?}"),
    };
    assert_eq!(start.request, NotifyRequest::Start);

    // The stub publishes the attribute value.
    let update = ResponseEvent::new(start.proxy, ATTR_X, SequenceNumber::NOTIFY, ResultType::NotifyOk)
        .with_payload(vec![1, 2]);
    f.kernel.manager.deliver_event(ServiceEvent::Response(update));
    pump(&mut f.ui_rx, &f.registry);
    assert_eq!(proxy.cached_value(ATTR_X), Some(vec![1, 2]));

    // A second subscriber is served from the cache, with no request upstream.
    assert!(proxy.set_notification(ATTR_X, ConsumerId(2), false));
    assert!(!proxy.set_notification(ATTR_X, ConsumerId(2), false));
    assert!(drain(&mut f.worker_rx).is_empty());
    assert_eq!(second.responses.lock().unwrap().len(), 1);
    assert_eq!(first.responses.lock().unwrap().len(), 1);

    proxy.clear_notification(ATTR_X, ConsumerId(1));
    assert!(drain(&mut f.worker_rx).is_empty());
    proxy.clear_notification(ATTR_X, ConsumerId(2));
    assert!(matches!(
        drain(&mut f.worker_rx).pop(),
        Some(ServiceEvent::NotifyRequest(e)) if e.request == NotifyRequest::Stop
    ));

    f.kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stub_loss_cancels_pending_call() {
    let mut f = fixture();
    f.kernel.manager.request_register_server(stub_on(&f.worker)).unwrap();
    let consumer = Arc::new(Recorder::default());
    let proxy = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    proxy.add_consumer(ConsumerId(1), consumer.clone());
    f.kernel.manager.flush().await.unwrap();
    pump(&mut f.ui_rx, &f.registry);

    let seq = proxy.send_request(REQUEST_COMPUTE, ConsumerId(1), Vec::new());
    f.kernel
        .manager
        .request_unregister_server(stub_on(&f.worker), DisconnectReason::ProviderDisconnected)
        .unwrap();
    f.kernel.manager.flush().await.unwrap();
    assert_eq!(pump(&mut f.ui_rx, &f.registry), 1);

    assert_eq!(proxy.state(), ConnectionState::Pending);
    let responses = consumer.responses.lock().unwrap().clone();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].sequence_nr, seq);
    assert_eq!(responses[0].result, ResultType::RequestCanceled);
    assert_eq!(
        *consumer.states.lock().unwrap(),
        vec![ConnectionState::Connected, ConnectionState::Pending]
    );

    f.kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_last_handle_drop_unregisters_client() {
    let mut f = fixture();
    f.kernel.manager.request_register_server(stub_on(&f.worker)).unwrap();
    let first = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    let second = f.registry.get_or_create(proxy_on(&f.ui), calc_interface());
    f.kernel.manager.flush().await.unwrap();
    assert_eq!(f.kernel.manager.client_list(&stub_on(&f.worker)).len(), 1);
    drain(&mut f.worker_rx);

    drop(first);
    f.kernel.manager.flush().await.unwrap();
    assert_eq!(f.kernel.manager.client_list(&stub_on(&f.worker)).len(), 1);

    drop(second);
    f.kernel.manager.flush().await.unwrap();
    assert!(f.kernel.manager.client_list(&stub_on(&f.worker)).is_empty());
    assert!(f.registry.is_empty());
    assert!(matches!(
        drain(&mut f.worker_rx).pop(),
        Some(ServiceEvent::StubConnection(e))
            if e.state == ConnectionState::Pending
                && e.reason == DisconnectReason::ConsumerDisconnected
    ));

    f.kernel.shutdown().await.unwrap();
}
