//! EventStore - bounded ring with per-source collapsing
//!
//! Lock scopes are always taken in the order writer -> ring -> index:
//! - `writer` serializes producers and guards the loss counters
//! - `ring` guards the slots and both cursors
//! - `index` maps a source to the slot that may still absorb its next event
//!
//! Readers take ring -> index only. The drain signal is raised after the
//! ring scope is released.
//!
//! Slots live inside the ring scope, so an insert keeps it until the fresh
//! slot is written and `write` advances. Readers wait for at most that one
//! slot move; no allocation or formatting happens under the scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use el_common::{Event, Severity, SourceKey, StoredEvent};

use crate::geometry::RingGeometry;

/// Result of [`EventStore::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Written to a fresh slot
    Inserted,
    /// Merged into the undelivered slot of the same source
    Collapsed,
    /// Ring full; the event was dropped and counted
    Overflow,
}

/// Whether the hash index may still route a source's events to a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashState {
    /// Not indexed
    #[default]
    None,
    /// Indexed but closed to collapsing until read
    Passive,
    /// Indexed and collapsible
    Active,
}

/// One event taken from the ring
#[derive(Debug, Clone)]
pub struct Drained {
    pub record: StoredEvent,
    /// More events remain after this one
    pub more_pending: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub lost: u64,
    pub lost_total: u64,
    pub size: usize,
    pub base: usize,
    pub extension: usize,
    pub inserted: u64,
    pub collapsed: u64,
    pub drained: u64,
}

#[derive(Debug, Default)]
struct RingSlot {
    event: Option<Event>,
    hash_state: HashState,
    max_severity: Severity,
    overwrite_count: u32,
}

#[derive(Debug, Default)]
struct WriterScope {
    /// Losses since the last record that reported them
    lost: u64,
    lost_total: u64,
}

#[derive(Debug)]
struct RingScope {
    slots: Vec<RingSlot>,
    read: usize,
    write: usize,
}

pub struct EventStore {
    geometry: RingGeometry,
    writer: Mutex<WriterScope>,
    ring: Mutex<RingScope>,
    index: Mutex<HashMap<SourceKey, usize>>,
    drain: Notify,
    inserted: AtomicU64,
    collapsed: AtomicU64,
    drained: AtomicU64,
}

impl EventStore {
    /// Pre-allocate a ring sized for `expected_sources` distinct sources
    pub fn new(expected_sources: usize) -> Self {
        Self::with_geometry(RingGeometry::for_sources(expected_sources))
    }

    pub fn with_geometry(geometry: RingGeometry) -> Self {
        let slots = (0..geometry.size).map(|_| RingSlot::default()).collect();
        Self {
            geometry,
            writer: Mutex::new(WriterScope::default()),
            ring: Mutex::new(RingScope {
                slots,
                read: 0,
                write: 0,
            }),
            index: Mutex::new(HashMap::with_capacity(geometry.size)),
            drain: Notify::new(),
            inserted: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    /// Store an event, collapsing it into an undelivered slot of the same
    /// source when that slot is still collapsible.
    pub fn insert(&self, event: Event) -> InsertOutcome {
        let mut writer = self.writer.lock();
        let outcome = self.insert_locked(&mut writer, event);

        match outcome {
            InsertOutcome::Inserted => {
                self.inserted.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("el_ring_inserted_total").increment(1);
                self.drain.notify_one();
            }
            InsertOutcome::Collapsed => {
                self.collapsed.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("el_ring_collapsed_total").increment(1);
            }
            InsertOutcome::Overflow => {
                metrics::counter!("el_ring_overflow_total").increment(1);
            }
        }
        outcome
    }

    fn insert_locked(&self, writer: &mut WriterScope, event: Event) -> InsertOutcome {
        let g = self.geometry;
        let key = event.source_key();
        let severity = event.new_state.severity;
        let alarm = event.is_alarm();

        let mut ring = self.ring.lock();
        let RingScope { slots, read, write } = &mut *ring;
        let (read, write) = (*read, *write);

        let mut index = self.index.lock();
        let previous = index.get(&key).copied();

        if let Some(slot_idx) = previous {
            let slot = &mut slots[slot_idx];
            if slot.hash_state == HashState::Active {
                slot.event = Some(event);
                slot.overwrite_count += 1;
                slot.max_severity = slot.max_severity.max(severity);
                if alarm && g.in_base(slot_idx, read) {
                    slot.hash_state = HashState::Passive;
                }
                return InsertOutcome::Collapsed;
            }
        }

        let next = g.next(write);
        if next == read {
            drop(index);
            writer.lost += 1;
            writer.lost_total += 1;
            if writer.lost == 1 {
                warn!(source = key, capacity = g.capacity(), "Event ring full, dropping events");
            }
            return InsertOutcome::Overflow;
        }

        let collapsible = !alarm || !g.in_base(write, read);
        let slot = &mut slots[write];
        slot.event = Some(event);
        slot.overwrite_count = 0;
        slot.max_severity = severity;

        if collapsible {
            slot.hash_state = HashState::Active;
            if let Some(stale) = previous {
                slots[stale].hash_state = HashState::None;
            }
            index.insert(key, write);
        } else {
            slot.hash_state = HashState::None;
            if let Some(stale) = previous {
                slots[stale].hash_state = HashState::Passive;
            }
        }
        drop(index);

        ring.write = next;
        InsertOutcome::Inserted
    }

    /// Take the oldest event, if any
    pub fn read(&self) -> Option<Drained> {
        let g = self.geometry;
        let mut ring = self.ring.lock();
        if ring.read == ring.write {
            return None;
        }

        let read = ring.read;
        let slot = &mut ring.slots[read];
        let event = slot.event.take()?;
        let record = StoredEvent {
            overwrite_count: slot.overwrite_count,
            max_severity: slot.max_severity,
            event,
        };
        let indexed = slot.hash_state != HashState::None;
        slot.hash_state = HashState::None;

        let mut index = self.index.lock();
        if indexed {
            let key = record.event.source_key();
            if index.get(&key) == Some(&read) {
                index.remove(&key);
            }
        }

        ring.read = g.next(read);
        let (read, write) = (ring.read, ring.write);

        // The alarm at the high-water mark may no longer be collapsed
        if g.position(write, read) > g.high_water_mark() {
            let ahead = (read + g.high_water_mark()) % g.size;
            let slot = &mut ring.slots[ahead];
            let alarm = slot.event.as_ref().is_some_and(Event::is_alarm);
            if slot.hash_state == HashState::Active && alarm {
                slot.hash_state = HashState::Passive;
            }
        }
        drop(index);

        self.drained.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("el_ring_pending").set(g.position(write, read) as f64);

        Some(Drained {
            record,
            more_pending: read != write,
        })
    }

    /// Wait for the drain signal. A signal raised with no waiter is kept
    /// for the next one.
    pub fn wait_for_events(&self) -> Notified<'_> {
        self.drain.notified()
    }

    /// Wake one more drainer, used when a read left events behind
    pub fn signal_drain(&self) {
        self.drain.notify_one();
    }

    /// Losses not yet reported in a record
    pub fn lost(&self) -> u64 {
        self.writer.lock().lost
    }

    /// Report and reset the transient loss count
    pub fn take_lost(&self) -> u64 {
        let mut writer = self.writer.lock();
        let lost = std::mem::take(&mut writer.lost);
        if lost > 0 {
            debug!(lost, "Reporting lost events");
        }
        lost
    }

    pub fn pending(&self) -> usize {
        let ring = self.ring.lock();
        self.geometry.position(ring.write, ring.read)
    }

    pub fn stats(&self) -> StoreStats {
        let (lost, lost_total) = {
            let writer = self.writer.lock();
            (writer.lost, writer.lost_total)
        };
        StoreStats {
            pending: self.pending(),
            lost,
            lost_total,
            size: self.geometry.size,
            base: self.geometry.base,
            extension: self.geometry.extension,
            inserted: self.inserted.load(Ordering::SeqCst),
            collapsed: self.collapsed.load(Ordering::SeqCst),
            drained: self.drained.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    fn hash_state_of(&self, key: SourceKey) -> Option<HashState> {
        let ring = self.ring.lock();
        let index = self.index.lock();
        index.get(&key).map(|&slot| ring.slots[slot].hash_state)
    }

    #[cfg(test)]
    fn slot_state(&self, slot: usize) -> HashState {
        self.ring.lock().slots[slot].hash_state
    }
}
