//! EventStore behaviour tests
//!
//! Tests for:
//! - Collapsing of repeated status events
//! - Protection of alarm transitions in the base region
//! - Delivery of every event while the ring has room
//! - Overflow accounting
//! - Concurrent producers and drainers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use el_common::{
    AlarmState, AlarmStatus, CapturedValue, Event, Severity, SourceDescriptor, SourceKey,
};
use el_ring::{EventStore, InsertOutcome};

fn sources(count: u32) -> Vec<Arc<SourceDescriptor>> {
    (0..count)
        .map(|key| Arc::new(SourceDescriptor::new(key, format!("TEST:AI{key:03}"))))
        .collect()
}

fn status(source: &Arc<SourceDescriptor>, value: i32) -> Event {
    Event::status(source.clone(), CapturedValue::long(value), AlarmState::normal(), Utc::now())
}

fn alarm(source: &Arc<SourceDescriptor>, value: i32, severity: Severity) -> Event {
    Event::alarm(
        source.clone(),
        CapturedValue::long(value),
        AlarmState::normal(),
        AlarmState::new(severity, AlarmStatus::High),
        Utc::now(),
    )
}

fn drain_all(store: &EventStore) -> Vec<el_common::StoredEvent> {
    let mut out = Vec::new();
    while let Some(drained) = store.read() {
        out.push(drained.record);
    }
    out
}

#[test]
fn test_repeated_status_collapses_to_latest() {
    let store = EventStore::new(20);
    let src = sources(1);

    for n in 1..=25 {
        let outcome = store.insert(status(&src[0], n));
        let expected = if n == 1 { InsertOutcome::Inserted } else { InsertOutcome::Collapsed };
        assert_eq!(outcome, expected);
    }

    let records = drain_all(&store);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.value, CapturedValue::long(25));
    assert_eq!(records[0].overwrite_count, 24);
}

#[test]
fn test_alarm_survives_later_status() {
    let store = EventStore::new(20);
    let src = sources(1);

    store.insert(status(&src[0], 1));
    store.insert(alarm(&src[0], 2, Severity::Major));
    for n in 3..10 {
        store.insert(status(&src[0], n));
    }

    let first = store.read().expect("alarm record");
    assert!(first.record.event.is_alarm());
    assert_eq!(first.record.event.value, CapturedValue::long(2));
    assert_eq!(first.record.event.new_state.severity, Severity::Major);

    // the trailing status events collapsed into one slot behind the alarm
    let rest = drain_all(&store);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].event.value, CapturedValue::long(9));
    assert_eq!(rest[0].overwrite_count, 6);
}

#[test]
fn test_no_loss_below_capacity() {
    let store = EventStore::new(16);
    let capacity = store.geometry().capacity();
    let src = sources(8);

    let mut latest: HashMap<SourceKey, CapturedValue> = HashMap::new();
    let mut last_seen: HashMap<SourceKey, CapturedValue> = HashMap::new();
    let mut record = |drained: Option<el_ring::Drained>| {
        if let Some(drained) = drained {
            let event = drained.record.event;
            last_seen.insert(event.source_key(), event.value);
        }
    };

    // interleave alarms and status events without ever filling the ring
    let mut value = 0;
    for round in 0..40 {
        for source in &src {
            value += 1;
            let event = if (round + source.key) % 5 == 0 {
                alarm(source, value, Severity::Minor)
            } else {
                status(source, value)
            };
            assert_ne!(store.insert(event), InsertOutcome::Overflow);
            latest.insert(source.key, CapturedValue::long(value));
            assert!(store.pending() <= capacity);
        }
        for _ in 0..6 {
            record(store.read());
        }
    }
    while store.pending() > 0 {
        record(store.read());
    }

    // every source's final state reached the drainer
    for (key, value) in latest {
        assert_eq!(last_seen.get(&key), Some(&value), "source {key}");
    }
    assert_eq!(store.stats().lost_total, 0);
}

#[test]
fn test_overflow_accounting() {
    let store = EventStore::new(10);
    let capacity = store.geometry().capacity();
    let src = sources(capacity as u32 + 1);

    // alarms in the base region never collapse; past it they are distinct sources
    for source in src.iter().take(capacity) {
        assert_eq!(store.insert(alarm(source, 1, Severity::Minor)), InsertOutcome::Inserted);
    }
    assert_eq!(store.pending(), capacity);

    let extra = &src[capacity];
    assert_eq!(store.insert(alarm(extra, 1, Severity::Minor)), InsertOutcome::Overflow);

    let stats = store.stats();
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.lost_total, 1);
    assert_eq!(stats.pending, capacity);

    let records = drain_all(&store);
    assert_eq!(records.len(), capacity);
    for (record, source) in records.iter().zip(&src) {
        assert_eq!(record.event.source_key(), source.key);
        assert_eq!(record.overwrite_count, 0);
    }

    assert_eq!(store.take_lost(), 1);
    assert_eq!(store.stats().lost, 0);
    assert_eq!(store.stats().lost_total, 1);
}

#[tokio::test]
async fn test_concurrent_producers_and_drainers() {
    let store = Arc::new(EventStore::new(64));
    let src = Arc::new(sources(32));

    let mut producers = Vec::new();
    for p in 0..4 {
        let store = store.clone();
        let src = src.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..200 {
                let source = &src[(p * 8 + n % 8) as usize];
                store.insert(status(source, n));
                if n % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let done = Arc::new(AtomicBool::new(false));
    let drainer = {
        let store = store.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut count = 0usize;
            loop {
                let finished = done.load(Ordering::SeqCst);
                match store.read() {
                    Some(_) => count += 1,
                    None if finished => break count,
                    None => tokio::task::yield_now().await,
                }
            }
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let drained = drainer.await.unwrap();

    let stats = store.stats();
    assert_eq!(stats.lost_total, 0);
    assert_eq!(stats.inserted as usize, drained);
    assert_eq!(stats.inserted + stats.collapsed, 800);
}
