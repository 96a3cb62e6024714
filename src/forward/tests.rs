//! Forwarding core tests against in-memory links

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::event::{Record, SubEvent};
use crate::remote::{RegistrationError, RemoteError, RemoteLinkStatus};

/// What a mock link does when subscribed
#[derive(Clone)]
enum StreamBehavior {
    /// Stream fails right away
    Fail,
    /// Deliver the payloads, then stay open
    DeliverThenHold(Vec<Bytes>),
}

struct MockLink {
    address: String,
    behavior: StreamBehavior,
    published: Mutex<Vec<Bytes>>,
    fail_publish: AtomicBool,
    lose_publish: AtomicBool,
    closed: AtomicBool,
}

impl MockLink {
    fn new(address: &str, behavior: StreamBehavior) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            behavior,
            published: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            lose_publish: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn published_records(&self) -> Vec<Record> {
        self.published
            .lock()
            .iter()
            .map(|p| crate::event::decode(p).unwrap())
            .collect()
    }
}

#[async_trait]
impl RemoteLink for MockLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn status(&self) -> RemoteLinkStatus {
        if self.closed.load(Ordering::SeqCst) {
            RemoteLinkStatus::Disconnected
        } else {
            RemoteLinkStatus::Connected
        }
    }

    async fn subscribe(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RemoteError> {
        match &self.behavior {
            StreamBehavior::Fail => Err(RemoteError::ConnectionLost("reset".to_string())),
            StreamBehavior::DeliverThenHold(payloads) => {
                for payload in payloads {
                    if sink.send(payload.clone()).await.is_err() {
                        return Ok(());
                    }
                }
                std::future::pending().await
            }
        }
    }

    async fn publish(&self, payload: Bytes) -> Result<(), RemoteError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RemoteError::Timeout);
        }
        if self.lose_publish.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionLost("broken pipe".to_string()));
        }
        self.published.lock().push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockConnector {
    behavior: StreamBehavior,
    connects: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl MockConnector {
    fn new(behavior: StreamBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(100),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteLink>, RemoteError> {
        tokio::time::sleep(self.delay).await;
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionLost("refused".to_string()));
        }
        Ok(MockLink::new(address, self.behavior.clone()))
    }
}

#[derive(Default)]
struct MockRegistry {
    statuses: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl NodeRegistry for MockRegistry {
    fn node_name(&self) -> &str {
        "mock"
    }

    async fn register(&self) -> Result<String, RegistrationError> {
        Ok("mock:1883".to_string())
    }

    async fn set_node_status(&self, count: u64, status: &str) -> Result<(), RemoteError> {
        self.statuses.lock().push((count, status.to_string()));
        Ok(())
    }

    async fn unregister(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn payload(value: serde_json::Value) -> Bytes {
    Bytes::from(value.to_string())
}

fn sample_payload() -> Bytes {
    payload(json!({
        "device_id": "device-1",
        "ts": 1700000000,
        "data": [
            {"typ": "counter", "in": 3, "out": 1},
            {"typ": "fillLevel", "level": 40}
        ]
    }))
}

fn processor(
    counter: Option<&str>,
    fill_level: Option<&str>,
) -> (RecordProcessor, Arc<MockLink>, ForwardCounter) {
    let filters = FilterSet::compile(counter, fill_level, None).unwrap();
    let destination = MockLink::new("dst:1883", StreamBehavior::Fail);
    let forwarded = ForwardCounter::new();
    let processor = RecordProcessor::new(
        Arc::new(filters),
        Publisher::new(destination.clone()),
        forwarded.clone(),
    );
    (processor, destination, forwarded)
}

// Record processing

#[tokio::test]
async fn test_process_keeps_matching_category() {
    let (processor, destination, counter) = processor(Some("device-1"), None);

    let outcome = processor.process(&sample_payload()).await;

    assert_eq!(outcome, Outcome::Forwarded { kept: 1, dropped: 1 });
    assert_eq!(counter.get(), 1);

    let published = destination.published_records();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].device_id, "device-1");
    assert_eq!(published[0].metadata["ts"], json!(1700000000));
    assert_eq!(
        published[0].data,
        vec![SubEvent::new("counter")
            .with_field("in", 3)
            .with_field("out", 1)]
    );
}

#[tokio::test]
async fn test_process_unset_counter_filter_excludes_counters() {
    let (processor, destination, _) = processor(None, Some(".*"));

    processor.process(&sample_payload()).await;

    let published = destination.published_records();
    assert_eq!(published[0].data.len(), 1);
    assert_eq!(published[0].data[0].typ, "fillLevel");
}

#[tokio::test]
async fn test_process_publishes_empty_result() {
    let (processor, destination, counter) = processor(Some("^other$"), None);

    let outcome = processor.process(&sample_payload()).await;

    assert_eq!(outcome, Outcome::Forwarded { kept: 0, dropped: 2 });
    assert_eq!(counter.get(), 1);
    let published = destination.published_records();
    assert_eq!(published.len(), 1);
    assert!(published[0].data.is_empty());
    assert_eq!(published[0].device_id, "device-1");
}

#[tokio::test]
async fn test_process_drops_malformed_payload() {
    let (processor, destination, counter) = processor(Some(".*"), Some(".*"));

    let malformed: [&[u8]; 4] = [b"not json", b"{}", br#"{"device_id": 5}"#, b""];
    for bad in malformed {
        assert_eq!(processor.process(bad).await, Outcome::Malformed);
    }

    assert_eq!(counter.get(), 0);
    assert!(destination.published.lock().is_empty());
}

#[tokio::test]
async fn test_process_publish_failure_is_not_counted() {
    let (processor, destination, counter) = processor(Some(".*"), None);
    destination.fail_publish.store(true, Ordering::SeqCst);

    let outcome = processor.process(&sample_payload()).await;

    assert_eq!(outcome, Outcome::PublishFailed);
    assert_eq!(counter.get(), 0);
}

// Destination redial

fn sample_record() -> Record {
    crate::event::decode(&sample_payload()).unwrap()
}

fn redialing_publisher(
    initial: Arc<MockLink>,
    connector: &Arc<MockConnector>,
) -> Publisher {
    Publisher::new(initial).with_redial(connector.clone(), "dst:1883", Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn test_publisher_redials_closed_destination() {
    let initial = MockLink::new("dst:1883", StreamBehavior::Fail);
    let connector = MockConnector::new(StreamBehavior::Fail);
    let publisher = redialing_publisher(initial.clone(), &connector);

    publisher.publish(&sample_record()).await.unwrap();
    assert_eq!(connector.connects(), 0);
    assert_eq!(initial.published.lock().len(), 1);

    // Broker went away; the next record goes out on a fresh link
    initial.close().await;
    publisher.publish(&sample_record()).await.unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(initial.published.lock().len(), 1);
    let current = publisher.link().current().await.unwrap();
    assert_eq!(current.status(), RemoteLinkStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_drops_link_lost_mid_publish() {
    let initial = MockLink::new("dst:1883", StreamBehavior::Fail);
    initial.lose_publish.store(true, Ordering::SeqCst);
    let connector = MockConnector::new(StreamBehavior::Fail);
    let publisher = redialing_publisher(initial, &connector);

    let err = publisher.publish(&sample_record()).await.unwrap_err();
    assert!(matches!(err, PublishError::Transport(RemoteError::ConnectionLost(_))));
    assert!(publisher.link().current().await.is_none());

    // The failed record is gone, the following one reconnects
    publisher.publish(&sample_record()).await.unwrap();
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_redial_waits_fixed_interval() {
    let initial = MockLink::new("dst:1883", StreamBehavior::Fail);
    let connector = MockConnector::new(StreamBehavior::Fail);
    connector.fail.store(true, Ordering::SeqCst);
    let publisher = redialing_publisher(initial.clone(), &connector);
    initial.close().await;

    assert!(publisher.publish(&sample_record()).await.is_err());
    assert_eq!(connector.connects(), 1);

    // Within the interval records fail without dialing
    assert!(publisher.publish(&sample_record()).await.is_err());
    assert_eq!(connector.connects(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    connector.fail.store(false, Ordering::SeqCst);
    publisher.publish(&sample_record()).await.unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_publisher_without_redial_keeps_failing() {
    let (processor, destination, counter) = processor(Some(".*"), None);
    destination.lose_publish.store(true, Ordering::SeqCst);

    assert_eq!(processor.process(&sample_payload()).await, Outcome::PublishFailed);
    assert_eq!(processor.process(&sample_payload()).await, Outcome::PublishFailed);
    assert_eq!(counter.get(), 0);
}

// Reconnection

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconnect_connects_once() {
    let initial = MockLink::new("src:1883", StreamBehavior::Fail);
    let link = SharedLink::new(initial.clone());
    let connector = MockConnector::new(StreamBehavior::Fail);
    let reconnector = Reconnector::new(
        link.clone(),
        connector.clone(),
        "src:1883",
        Duration::from_secs(5),
    );

    tokio::join!(reconnector.reconnect(), reconnector.reconnect());

    assert_eq!(connector.connects(), 1);
    assert_eq!(reconnector.attempts(), 2);
    assert!(link.current().await.is_some());
    assert_eq!(initial.status(), RemoteLinkStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_fixed_backoff() {
    let link = SharedLink::empty();
    let connector = MockConnector::new(StreamBehavior::Fail);
    let reconnector = Reconnector::new(
        link.clone(),
        connector.clone(),
        "src:1883",
        Duration::from_secs(5),
    );

    let start = tokio::time::Instant::now();
    reconnector.reconnect().await;

    // backoff plus the connector's own delay
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(5100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(5200), "{:?}", elapsed);
    assert_eq!(reconnector.backoff(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reuses_link_installed_meanwhile() {
    let link = SharedLink::empty();
    let connector = MockConnector::new(StreamBehavior::Fail);
    let reconnector = Arc::new(Reconnector::new(
        link.clone(),
        connector.clone(),
        "src:1883",
        Duration::from_secs(5),
    ));

    let task = tokio::spawn({
        let reconnector = reconnector.clone();
        async move { reconnector.reconnect().await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let installed: Arc<dyn RemoteLink> = MockLink::new("other:1883", StreamBehavior::Fail);
    link.install(installed.clone()).await;
    task.await.unwrap();

    assert_eq!(connector.connects(), 0);
    let current = link.current().await.unwrap();
    assert!(Arc::ptr_eq(&current, &installed));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_leaves_cell_empty() {
    let link = SharedLink::empty();
    let connector = MockConnector::new(StreamBehavior::Fail);
    connector.fail.store(true, Ordering::SeqCst);
    let reconnector = Reconnector::new(
        link.clone(),
        connector.clone(),
        "src:1883",
        Duration::from_secs(5),
    );

    reconnector.reconnect().await;

    assert_eq!(connector.connects(), 1);
    assert!(link.current().await.is_none());
}

// Subscription loop

fn spawn_loop(
    link: SharedLink,
    connector: Arc<MockConnector>,
    backoff: Duration,
) -> (
    Arc<Reconnector>,
    tokio::sync::watch::Receiver<LoopState>,
    mpsc::Receiver<Bytes>,
    broadcast::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let reconnector = Arc::new(Reconnector::new(
        link.clone(),
        connector,
        "src:1883",
        backoff,
    ));
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let subscription = SubscriptionLoop::new(link, reconnector.clone(), tx);
    let state = subscription.state();
    let handle = tokio::spawn(subscription.run(shutdown_rx));
    (reconnector, state, rx, shutdown_tx, handle)
}

#[tokio::test(start_paused = true)]
async fn test_each_termination_costs_one_backoff() {
    let link = SharedLink::new(MockLink::new("src:1883", StreamBehavior::Fail));
    let mut connector = MockConnector::new(StreamBehavior::Fail);
    Arc::get_mut(&mut connector).unwrap().delay = Duration::ZERO;

    let (reconnector, _state, _rx, shutdown_tx, handle) =
        spawn_loop(link, connector.clone(), Duration::from_secs(5));

    // Terminations at t=0, 5, 10, 15; connects complete at 5, 10, 15
    tokio::time::sleep(Duration::from_millis(14_900)).await;
    assert_eq!(connector.connects(), 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(connector.connects(), 3);
    assert_eq!(reconnector.attempts(), 4);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_link_goes_straight_to_reconnect() {
    let connector = MockConnector::new(StreamBehavior::DeliverThenHold(vec![sample_payload()]));

    let (_reconnector, mut state, mut rx, shutdown_tx, handle) =
        spawn_loop(SharedLink::empty(), connector.clone(), Duration::from_secs(5));

    // The fresh link delivers its payload once the loop subscribes on it
    let received = rx.recv().await.unwrap();
    assert_eq!(received, sample_payload());
    assert_eq!(connector.connects(), 1);

    state
        .wait_for(|s| *s == LoopState::AwaitingStream)
        .await
        .unwrap();

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
    assert_eq!(*state.borrow(), LoopState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_outage_reports_reconnecting_until_link_is_back() {
    let connector = MockConnector::new(StreamBehavior::DeliverThenHold(Vec::new()));
    connector.fail.store(true, Ordering::SeqCst);

    let (reconnector, mut state, _rx, shutdown_tx, handle) =
        spawn_loop(SharedLink::empty(), connector.clone(), Duration::from_secs(5));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut recorder = state.clone();
    let recorded = seen.clone();
    tokio::spawn(async move {
        while recorder.changed().await.is_ok() {
            recorded.lock().push(*recorder.borrow_and_update());
        }
    });

    tokio::time::sleep(Duration::from_millis(16_000)).await;
    assert!(reconnector.attempts() >= 3);
    assert_eq!(*state.borrow(), LoopState::Reconnecting);
    assert!(seen
        .lock()
        .iter()
        .all(|s| *s == LoopState::Reconnecting));

    // Broker is back: the next attempt installs a link and subscribes
    connector.fail.store(false, Ordering::SeqCst);
    state
        .wait_for(|s| *s == LoopState::AwaitingStream)
        .await
        .unwrap();

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_subscription() {
    let link = SharedLink::new(MockLink::new(
        "src:1883",
        StreamBehavior::DeliverThenHold(Vec::new()),
    ));
    let connector = MockConnector::new(StreamBehavior::Fail);

    let (_reconnector, mut state, _rx, shutdown_tx, handle) =
        spawn_loop(link, connector.clone(), Duration::from_secs(5));

    state
        .wait_for(|s| *s == LoopState::AwaitingStream)
        .await
        .unwrap();
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(*state.borrow(), LoopState::Terminated);
    assert_eq!(connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_backoff() {
    let link = SharedLink::new(MockLink::new("src:1883", StreamBehavior::Fail));
    let connector = MockConnector::new(StreamBehavior::Fail);

    let (_reconnector, mut state, _rx, shutdown_tx, handle) =
        spawn_loop(link, connector.clone(), Duration::from_secs(3600));

    state
        .wait_for(|s| *s == LoopState::Reconnecting)
        .await
        .unwrap();
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(*state.borrow(), LoopState::Terminated);
    assert_eq!(connector.connects(), 0);
}

// Status reporting

#[tokio::test(start_paused = true)]
async fn test_status_reporter_reports_immediately_then_periodically() {
    let registry = Arc::new(MockRegistry::default());
    let counter = ForwardCounter::new();
    counter.increment();
    let reporter = StatusReporter::new(
        registry.clone(),
        counter.clone(),
        "recv",
        Duration::from_secs(3),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(reporter.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*registry.statuses.lock(), vec![(1, "recv:1".to_string())]);

    counter.increment();
    tokio::time::sleep(Duration::from_secs(6)).await;

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    let statuses = registry.statuses.lock().clone();
    assert_eq!(
        statuses,
        vec![
            (1, "recv:1".to_string()),
            (2, "recv:2".to_string()),
            (2, "recv:2".to_string()),
        ]
    );
}

// Full pipeline

#[tokio::test]
async fn test_forwarder_pipeline() {
    let source = MockLink::new(
        "src:1883",
        StreamBehavior::DeliverThenHold(vec![
            sample_payload(),
            Bytes::from_static(b"garbage"),
            payload(json!({"device_id": "sensor-9", "data": [{"typ": "counter"}]})),
        ]),
    );
    let destination = MockLink::new("dst:1883", StreamBehavior::Fail);
    let source_registry = Arc::new(MockRegistry::default());
    let destination_registry = Arc::new(MockRegistry::default());

    let forwarder = Forwarder::start(
        ForwarderParts {
            source: SharedLink::new(source),
            source_address: "src:1883".to_string(),
            source_connector: MockConnector::new(StreamBehavior::Fail),
            destination: destination.clone(),
            destination_address: "dst:1883".to_string(),
            destination_connector: MockConnector::new(StreamBehavior::Fail),
            filters: Arc::new(FilterSet::compile(Some("device"), None, None).unwrap()),
            source_registry: source_registry.clone(),
            destination_registry: destination_registry.clone(),
        },
        ForwardSettings::default(),
    );

    for _ in 0..100 {
        if forwarder.counter().get() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(forwarder.counter().get(), 2);
    assert_eq!(forwarder.loop_state(), LoopState::AwaitingStream);

    forwarder.shutdown().await;

    let published = destination.published_records();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].data.len(), 1);
    assert!(published[1].data.is_empty());

    let first_src = source_registry.statuses.lock()[0].1.clone();
    let first_dst = destination_registry.statuses.lock()[0].1.clone();
    assert!(first_src.starts_with("recv:"));
    assert!(first_dst.starts_with("sent:"));
}
