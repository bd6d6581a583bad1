//! Delivery Tests
//!
//! Tests for:
//! - Retrying a record until it is acknowledged
//! - Following the selection while a record is retried
//! - Stopping a pending delivery on shutdown
//! - Sender pool formatting, loss reporting and placeholders
//! - End-to-end delivery over UDP to a local collector

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use el_common::{
    AlarmState, AlarmStatus, CapturedValue, Event, Severity, SourceDescriptor, ValueKind,
    WireFields,
};
use el_config::{ClientConfig, PointConfig, TimingConfig};
use el_delivery::{
    CallerSlot, CallerTable, Deliverer, DeliveryOutcome, DestinationTable, EventLogClient,
    RecordFormatter, SenderPool, SourceSnapshot, StaticValueSource, Transport, TransportError,
    ValueSource,
};
use el_ring::EventStore;

// ============================================================================
// Mock transport
// ============================================================================

/// Fails the first `failures` round trips, then acknowledges everything
#[derive(Default)]
struct FlakyTransport {
    failures: AtomicU32,
    next_id: AtomicU64,
    sent: Mutex<Vec<(SocketAddr, String)>>,
}

impl FlakyTransport {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn round_trip(
        &self,
        _caller: &CallerSlot,
        destination: SocketAddr,
        _id: u64,
        record: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.sent.lock().push((destination, record.to_string()));
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(TransportError::Timeout {
                destination,
                timeout,
            })
        } else {
            Ok(())
        }
    }
}

fn addr(text: &str) -> SocketAddr {
    text.parse().unwrap()
}

fn table() -> Arc<DestinationTable> {
    Arc::new(DestinationTable::new([
        addr("10.0.0.1:18324"),
        addr("10.0.0.2:18324"),
    ]))
}

fn timing() -> TimingConfig {
    TimingConfig {
        beacon_period_ms: 50,
        ..TimingConfig::default()
    }
}

// ============================================================================
// Deliverer
// ============================================================================

#[tokio::test]
async fn test_retries_until_acknowledged() {
    let destinations = table();
    destinations.select(0);
    let transport = Arc::new(FlakyTransport::failing(3));
    let deliverer = Deliverer::new(destinations.clone(), transport.clone(), &timing());
    let caller = CallerSlot::new("sender-1");
    let (_tx, mut shutdown) = broadcast::channel(1);

    let outcome = deliverer.deliver(&caller, 7, "ID=7;", &mut shutdown).await;

    assert_eq!(
        outcome,
        DeliveryOutcome::Delivered {
            destination: 0,
            attempts: 4
        }
    );
    assert_eq!(deliverer.delivered(), 1);
    assert_eq!(deliverer.retries(), 3);
    assert!(transport.sent.lock().iter().all(|(to, r)| *to == addr("10.0.0.1:18324") && r == "ID=7;"));
}

#[tokio::test]
async fn test_retry_follows_selection_change() {
    let destinations = table();
    destinations.select(0);
    let transport = Arc::new(FlakyTransport::failing(u32::MAX));
    let deliverer = Arc::new(Deliverer::new(destinations.clone(), transport.clone(), &timing()));
    let (_tx, mut shutdown) = broadcast::channel(1);

    let task = {
        let deliverer = deliverer.clone();
        tokio::spawn(async move {
            let caller = CallerSlot::new("sender-1");
            deliverer.deliver(&caller, 1, "ID=1;", &mut shutdown).await
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    destinations.select(1);
    transport.failures.store(0, Ordering::SeqCst);

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("delivery finishes")
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Delivered { destination: 1, .. }));
}

#[tokio::test]
async fn test_shutdown_stops_pending_delivery() {
    let destinations = table();
    let transport = Arc::new(FlakyTransport::default());
    let deliverer = Deliverer::new(destinations, transport.clone(), &timing());
    let caller = CallerSlot::new("sender-1");
    let (tx, mut shutdown) = broadcast::channel(1);

    // nothing selected, so the record waits until shutdown
    tx.send(()).unwrap();
    let outcome = deliverer.deliver(&caller, 1, "ID=1;", &mut shutdown).await;

    assert_eq!(outcome, DeliveryOutcome::Stopped);
    assert!(transport.sent.lock().is_empty());
    assert_eq!(deliverer.delivered(), 0);
}

// ============================================================================
// SenderPool
// ============================================================================

fn source(key: u32, name: &str) -> Arc<SourceDescriptor> {
    Arc::new(
        SourceDescriptor::new(key, name)
            .with_description("Tank level")
            .with_record_type("ai"),
    )
}

fn pool_with(header: &str, store: Arc<EventStore>, transport: Arc<FlakyTransport>) -> SenderPool {
    let destinations = table();
    destinations.select(1);
    SenderPool::new(
        store,
        Arc::new(RecordFormatter::new(header, Vec::new())),
        Arc::new(Deliverer::new(destinations, transport, &timing())),
        Arc::new(CallerTable::new(2)),
        Duration::ZERO,
    )
}

#[tokio::test]
async fn test_pool_formats_and_delivers_drained_event() {
    let store = Arc::new(EventStore::new(4));
    store.insert(Event::alarm(
        source(1, "TEST:LEVEL"),
        CapturedValue::double(3.25),
        AlarmState::normal(),
        AlarmState::new(Severity::Minor, AlarmStatus::High),
        Utc::now(),
    ));
    let transport = Arc::new(FlakyTransport::default());
    let pool = pool_with("HOST-PHYS=test;", store.clone(), transport.clone());
    let caller = CallerSlot::new("sender-1");
    let (_tx, mut shutdown) = broadcast::channel(1);

    let drained = store.read().unwrap();
    let outcome = pool.process(0, &caller, drained, &mut shutdown).await;

    assert!(matches!(outcome, Some(DeliveryOutcome::Delivered { destination: 1, attempts: 1 })));
    let sent = transport.sent.lock();
    assert_eq!(sent.len(), 1);
    let record = &sent[0].1;
    assert!(record.starts_with("HOST-PHYS=test;ID=1;APPLICATION-ID=alarmLog;TYPE=event;"));
    assert!(record.contains("NAME=TEST:LEVEL;TEXT=Tank level;VALUE=3.25;"));
    assert!(record.ends_with("SEVERITY=MINOR;STATUS=HIGH;"));
    assert_eq!(pool.stats().delivered, 1);
}

#[tokio::test]
async fn test_pool_reports_loss_once() {
    // a ring for no sources holds a single event
    let store = Arc::new(EventStore::new(0));
    let first = source(1, "TEST:A");
    let second = source(2, "TEST:B");
    store.insert(Event::status(first, CapturedValue::none(), AlarmState::normal(), Utc::now()));
    store.insert(Event::status(second.clone(), CapturedValue::none(), AlarmState::normal(), Utc::now()));
    assert_eq!(store.lost(), 1);

    let transport = Arc::new(FlakyTransport::default());
    let pool = pool_with("HOST-PHYS=test;", store.clone(), transport.clone());
    let caller = CallerSlot::new("sender-1");
    let (_tx, mut shutdown) = broadcast::channel(1);

    let drained = store.read().unwrap();
    pool.process(0, &caller, drained, &mut shutdown).await;
    store.insert(Event::status(second, CapturedValue::none(), AlarmState::normal(), Utc::now()));
    let drained = store.read().unwrap();
    pool.process(0, &caller, drained, &mut shutdown).await;

    let sent = transport.sent.lock();
    assert!(sent[0].1.ends_with("LOST=1;"));
    assert!(!sent[1].1.contains("LOST="));
    assert_eq!(store.stats().lost_total, 1);
}

#[tokio::test]
async fn test_pool_sends_placeholder_for_oversized_record() {
    let store = Arc::new(EventStore::new(4));
    store.insert(Event::status(source(1, "TEST:A"), CapturedValue::none(), AlarmState::normal(), Utc::now()));
    let transport = Arc::new(FlakyTransport::default());
    let header = format!("HOST-PHYS={};", "h".repeat(400));
    let pool = pool_with(&header, store.clone(), transport.clone());
    let caller = CallerSlot::new("sender-1");
    let (_tx, mut shutdown) = broadcast::channel(1);

    let drained = store.read().unwrap();
    let outcome = pool.process(0, &caller, drained, &mut shutdown).await;

    assert!(matches!(outcome, Some(DeliveryOutcome::Delivered { .. })));
    let sent = transport.sent.lock();
    assert!(sent[0].1.ends_with("ID=1;TYPE=sysMsg;TEXT=Error - Message too long;"));
    assert_eq!(pool.stats().format_errors, 1);
}

// ============================================================================
// End to end
// ============================================================================

/// Acknowledges every datagram and keeps the text of each one
async fn spawn_collector() -> (SocketAddr, Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            let Ok(fields) = WireFields::from_datagram(&buf[..len]) else {
                continue;
            };
            if let Some(id) = fields.id() {
                let reply = format!("ID={id};REPLY=Ok;");
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
            let text = String::from_utf8_lossy(&buf[..len]).trim_end_matches('\0').to_string();
            log.lock().push(text);
        }
    });

    (address, received, handle)
}

async fn wait_for(received: &Mutex<Vec<String>>, pattern: &str) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if received.lock().iter().any(|r| r.contains(pattern)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_end_to_end_over_udp() {
    let (collector, received, handle) = spawn_collector().await;

    let config = ClientConfig {
        destinations: vec![collector.to_string()],
        bind_address: "127.0.0.1".to_string(),
        reply_port: Some(0),
        command_port: 0,
        physical_host: Some("e2e-host".to_string()),
        timing: TimingConfig {
            init_wait_ms: 0,
            beacon_period_ms: 100,
            ..TimingConfig::default()
        },
        points: vec![PointConfig {
            name: "TEST:TEMP".to_string(),
            description: "Inlet temperature".to_string(),
            record_type: "ai".to_string(),
            kind: ValueKind::Double,
            enum_labels: Vec::new(),
        }],
        ..ClientConfig::default()
    };
    let values = Arc::new(StaticValueSource::from_points(&config.points));
    let client = EventLogClient::new(config, values.clone()).unwrap();
    client.start().await.unwrap();

    // start-up snapshot of the point
    assert!(wait_for(&received, "TYPE=status;").await);
    assert!(wait_for(&received, "TEXT=selected;").await);

    let temp = values.find("TEST:TEMP").unwrap();
    let before = values.snapshot(&temp).unwrap();
    let after = SourceSnapshot::new(
        CapturedValue::double(81.5),
        AlarmState::new(Severity::Major, AlarmStatus::HiHi),
    );
    values.update("TEST:TEMP", after);
    client
        .alarm_log()
        .log_transition(temp, after.value, before.state, after.state, Utc::now());
    assert!(wait_for(&received, "VALUE=81.5;SEVERITY-OLD=INVALID;STATUS-OLD=UDF;SEVERITY=MAJOR;STATUS=HIHI;").await);

    client.system_log().log("disk nearly full");
    assert!(wait_for(&received, "APPLICATION-ID=sysMsgLog;").await);

    let report = client.report();
    assert!(report.running);
    assert_eq!(report.selected().map(|d| d.address), Some(collector));
    assert!(report.senders.delivered >= 2);
    assert!(report.replies.routed >= 3);

    client.shutdown(Duration::from_secs(2)).await;
    handle.abort();

    let records = received.lock();
    assert!(records.iter().all(|r| r.starts_with("HOST-PHYS=e2e-host;") || r.starts_with("ID=")));
}
