//! Producer facade
//!
//! `ValueSource` is the seam to whatever owns the monitored points. The
//! `AlarmLog` turns transitions and snapshots of those points into events
//! in the ring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use el_common::{
    AlarmState, AlarmStatus, CapturedValue, Event, Severity, SourceDescriptor, SourceKey,
};
use el_config::PointConfig;
use el_ring::{EventStore, InsertOutcome};

use crate::error::DeliveryError;
use crate::Result;

/// Current value and alarm state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub value: CapturedValue,
    pub state: AlarmState,
}

impl SourceSnapshot {
    pub fn new(value: CapturedValue, state: AlarmState) -> Self {
        Self { value, state }
    }

    /// State of a point that has never been processed
    pub fn undefined(value: CapturedValue) -> Self {
        Self::new(value, AlarmState::new(Severity::Invalid, AlarmStatus::Udf))
    }
}

pub trait ValueSource: Send + Sync {
    fn sources(&self) -> Vec<Arc<SourceDescriptor>>;

    fn find(&self, name: &str) -> Option<Arc<SourceDescriptor>>;

    fn snapshot(&self, source: &SourceDescriptor) -> Option<SourceSnapshot>;

    fn count(&self) -> usize {
        self.sources().len()
    }
}

// ============================================================================
// StaticValueSource
// ============================================================================

/// A fixed set of points whose values are pushed in by the owner
#[derive(Default)]
pub struct StaticValueSource {
    descriptors: Vec<Arc<SourceDescriptor>>,
    by_name: HashMap<String, usize>,
    snapshots: RwLock<Vec<SourceSnapshot>>,
}

impl StaticValueSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: &[PointConfig]) -> Self {
        points.iter().fold(Self::new(), |source, point| {
            let key = source.descriptors.len() as SourceKey;
            let descriptor = SourceDescriptor::new(key, point.name.clone())
                .with_description(point.description.clone())
                .with_record_type(point.record_type.clone())
                .with_enum_labels(point.enum_labels.iter().cloned());
            let initial = SourceSnapshot::undefined(CapturedValue::from_raw(point.kind, [0; 8]));
            source.with_source(descriptor, initial)
        })
    }

    /// Add a point; a later point with the same name shadows the earlier one
    pub fn with_source(mut self, descriptor: SourceDescriptor, snapshot: SourceSnapshot) -> Self {
        let index = self.descriptors.len();
        self.by_name.insert(descriptor.name.clone(), index);
        self.descriptors.push(Arc::new(descriptor));
        self.snapshots.get_mut().push(snapshot);
        self
    }

    /// Replace a point's snapshot, returning the previous one
    pub fn update(&self, name: &str, snapshot: SourceSnapshot) -> Option<SourceSnapshot> {
        let index = *self.by_name.get(name)?;
        let mut snapshots = self.snapshots.write();
        Some(std::mem::replace(&mut snapshots[index], snapshot))
    }
}

impl ValueSource for StaticValueSource {
    fn sources(&self) -> Vec<Arc<SourceDescriptor>> {
        self.descriptors.clone()
    }

    fn find(&self, name: &str) -> Option<Arc<SourceDescriptor>> {
        self.by_name.get(name).map(|&i| self.descriptors[i].clone())
    }

    fn snapshot(&self, source: &SourceDescriptor) -> Option<SourceSnapshot> {
        let index = *self.by_name.get(&source.name)?;
        self.snapshots.read().get(index).copied()
    }

    fn count(&self) -> usize {
        self.descriptors.len()
    }
}

// ============================================================================
// AlarmLog
// ============================================================================

pub struct AlarmLog {
    store: Arc<EventStore>,
    source: Arc<dyn ValueSource>,
    excluded_record_types: Vec<String>,
    enabled: AtomicBool,
}

impl AlarmLog {
    pub fn new(
        store: Arc<EventStore>,
        source: Arc<dyn ValueSource>,
        excluded_record_types: Vec<String>,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            source,
            excluded_record_types,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            info!(enabled, "Alarm logging toggled");
        }
    }

    pub fn value_source(&self) -> &Arc<dyn ValueSource> {
        &self.source
    }

    fn is_excluded(&self, source: &SourceDescriptor) -> bool {
        self.excluded_record_types
            .iter()
            .any(|t| *t == source.record_type)
    }

    /// Record an alarm transition. `None` when logging is off or the
    /// source's record type is excluded.
    pub fn log_transition(
        &self,
        source: Arc<SourceDescriptor>,
        value: CapturedValue,
        old_state: AlarmState,
        new_state: AlarmState,
        timestamp: DateTime<Utc>,
    ) -> Option<InsertOutcome> {
        if !self.is_enabled() || self.is_excluded(&source) {
            return None;
        }
        let outcome = self
            .store
            .insert(Event::alarm(source, value, old_state, new_state, timestamp));
        Some(outcome)
    }

    /// Queue the current state of one source by name
    pub fn queue_source(&self, name: &str) -> Result<InsertOutcome> {
        if !self.is_enabled() {
            return Err(DeliveryError::Disabled);
        }
        let source = self
            .source
            .find(name)
            .ok_or_else(|| DeliveryError::UnknownSource(name.to_string()))?;
        self.queue_snapshot(source)
            .ok_or_else(|| DeliveryError::UnknownSource(name.to_string()))
    }

    /// Queue the current state of every logged source; returns how many
    pub fn queue_all(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let queued = self
            .source
            .sources()
            .into_iter()
            .filter(|source| !self.is_excluded(source))
            .filter_map(|source| self.queue_snapshot(source))
            .count();
        debug!(queued, "Queued status of all sources");
        queued
    }

    fn queue_snapshot(&self, source: Arc<SourceDescriptor>) -> Option<InsertOutcome> {
        let snapshot = self.source.snapshot(&source)?;
        let event = Event::status(source, snapshot.value, snapshot.state, Utc::now());
        Some(self.store.insert(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use el_common::ValueKind;

    fn points() -> Vec<PointConfig> {
        ["TEST:AI", "TEST:ARCH", "TEST:BO"]
            .iter()
            .map(|name| PointConfig {
                name: name.to_string(),
                description: String::new(),
                record_type: if name.ends_with("ARCH") { "arch" } else { "ai" }.to_string(),
                kind: ValueKind::Double,
                enum_labels: Vec::new(),
            })
            .collect()
    }

    fn alarm_log(enabled: bool) -> (AlarmLog, Arc<EventStore>, Arc<StaticValueSource>) {
        let store = Arc::new(EventStore::new(10));
        let source = Arc::new(StaticValueSource::from_points(&points()));
        let log = AlarmLog::new(store.clone(), source.clone(), vec!["arch".to_string()], enabled);
        (log, store, source)
    }

    #[test]
    fn test_static_source_update() {
        let source = StaticValueSource::from_points(&points());
        assert_eq!(source.count(), 3);
        let ai = source.find("TEST:AI").unwrap();
        assert_eq!(ai.key, 0);

        let initial = source.snapshot(&ai).unwrap();
        assert_eq!(initial.state.status, AlarmStatus::Udf);

        let next = SourceSnapshot::new(CapturedValue::double(1.5), AlarmState::normal());
        assert_eq!(source.update("TEST:AI", next), Some(initial));
        assert_eq!(source.snapshot(&ai), Some(next));
        assert_eq!(source.update("MISSING", next), None);
    }

    #[test]
    fn test_queue_all_skips_excluded() {
        let (log, store, _) = alarm_log(true);
        assert_eq!(log.queue_all(), 2);
        assert_eq!(store.pending(), 2);
    }

    #[test]
    fn test_queue_source() {
        let (log, store, _) = alarm_log(true);
        assert_eq!(log.queue_source("TEST:BO").unwrap(), InsertOutcome::Inserted);
        assert_eq!(log.queue_source("TEST:BO").unwrap(), InsertOutcome::Collapsed);
        assert!(matches!(log.queue_source("NOPE"), Err(DeliveryError::UnknownSource(_))));
        assert_eq!(store.pending(), 1);
    }

    #[test]
    fn test_transition_filters() {
        let (log, store, source) = alarm_log(true);
        let ai = source.find("TEST:AI").unwrap();
        let arch = source.find("TEST:ARCH").unwrap();
        let major = AlarmState::new(Severity::Major, AlarmStatus::High);

        assert_eq!(
            log.log_transition(ai.clone(), CapturedValue::double(9.0), AlarmState::normal(), major, Utc::now()),
            Some(InsertOutcome::Inserted)
        );
        assert_eq!(
            log.log_transition(arch, CapturedValue::double(9.0), AlarmState::normal(), major, Utc::now()),
            None
        );

        log.set_enabled(false);
        assert_eq!(
            log.log_transition(ai, CapturedValue::double(9.0), major, AlarmState::normal(), Utc::now()),
            None
        );
        assert_eq!(log.queue_all(), 0);
        assert!(matches!(log.queue_source("TEST:AI"), Err(DeliveryError::Disabled)));
        assert_eq!(store.pending(), 1);
    }
}
