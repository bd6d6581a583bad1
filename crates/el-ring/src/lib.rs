//! Event ring for the event-log delivery client
//!
//! This crate provides:
//! - EventStore: a bounded circular buffer of event slots with a per-source
//!   hash index, so a newer event can replace an undelivered one in place
//! - RingGeometry: ring sizing from the expected number of sources
//! - StoreStats: counters for the operator report

pub mod geometry;
pub mod store;

pub use geometry::RingGeometry;
pub use store::{Drained, EventStore, HashState, InsertOutcome, StoreStats};
