//! Destination table and active selection
//!
//! Liveness flags and last-send times are written by the failover
//! coordinator and by delivering tasks. The selection is written only by the
//! coordinator; the command server may only post a [`SwitchRequest`].

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const NONE: usize = usize::MAX;

/// Selection change posted for the coordinator's next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchRequest {
    #[default]
    None,
    /// Switch to this destination (takeover)
    To(usize),
    /// Move away from the current destination (disconnect)
    AnyOther,
}

#[derive(Debug)]
pub struct Destination {
    address: SocketAddr,
    up: AtomicBool,
    last_send: Mutex<Option<Instant>>,
}

impl Destination {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            up: AtomicBool::new(false),
            last_send: Mutex::new(None),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Returns true if the flag changed
    pub fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::SeqCst) != up
    }

    /// Record a successful exchange
    pub fn touch(&self) {
        *self.last_send.lock() = Some(Instant::now());
    }

    /// A destination never heard from counts as silent
    pub fn is_silent(&self, max_silent: Duration) -> bool {
        match *self.last_send.lock() {
            Some(at) => at.elapsed() > max_silent,
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct DestinationTable {
    entries: Vec<Destination>,
    active: AtomicUsize,
    last: AtomicUsize,
    request: Mutex<SwitchRequest>,
}

impl DestinationTable {
    pub fn new(addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            entries: addresses.into_iter().map(Destination::new).collect(),
            active: AtomicUsize::new(NONE),
            last: AtomicUsize::new(NONE),
            request: Mutex::new(SwitchRequest::None),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Destination> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Destination)> {
        self.entries.iter().enumerate()
    }

    /// Configured destination sending from `ip`, if any
    pub fn position_by_ip(&self, ip: IpAddr) -> Option<usize> {
        self.entries.iter().position(|d| d.address.ip() == ip)
    }

    /// Destination a datagram from `ip` is attributed to. The selected
    /// destination wins when several entries share the host.
    pub fn sender_index(&self, ip: IpAddr) -> Option<usize> {
        match self.selected_address() {
            Some((index, address)) if address.ip() == ip => Some(index),
            _ => self.position_by_ip(ip),
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// One snapshot of the active destination
    pub fn selected(&self) -> Option<usize> {
        match self.active.load(Ordering::SeqCst) {
            NONE => None,
            index => Some(index),
        }
    }

    pub fn selected_address(&self) -> Option<(usize, SocketAddr)> {
        let index = self.selected()?;
        self.get(index).map(|d| (index, d.address))
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.selected() == Some(index)
    }

    pub fn last_selected(&self) -> Option<usize> {
        match self.last.load(Ordering::SeqCst) {
            NONE => None,
            index => Some(index),
        }
    }

    /// Commit a selection
    pub fn select(&self, index: usize) {
        self.active.store(index, Ordering::SeqCst);
        self.last.store(index, Ordering::SeqCst);
        metrics::gauge!("el_selected_destination").set(index as f64);
    }

    pub fn clear_selection(&self) {
        self.active.store(NONE, Ordering::SeqCst);
        metrics::gauge!("el_selected_destination").set(-1.0);
    }

    pub fn request_switch(&self, request: SwitchRequest) {
        *self.request.lock() = request;
    }

    pub fn pending_request(&self) -> SwitchRequest {
        *self.request.lock()
    }

    pub fn take_request(&self) -> SwitchRequest {
        std::mem::take(&mut *self.request.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DestinationTable {
        DestinationTable::new(["10.0.0.1:18324", "10.0.0.2:18324"].map(|a| a.parse().unwrap()))
    }

    #[test]
    fn test_selection_tracks_last() {
        let table = table();
        assert_eq!(table.selected(), None);
        assert_eq!(table.last_selected(), None);

        table.select(1);
        assert!(table.is_selected(1));
        table.clear_selection();
        assert_eq!(table.selected(), None);
        assert_eq!(table.last_selected(), Some(1));
    }

    #[test]
    fn test_liveness_flags() {
        let table = table();
        let dest = table.get(0).unwrap();
        assert!(!dest.is_up());
        assert!(dest.set_up(true));
        assert!(!dest.set_up(true));
        assert!(dest.is_silent(Duration::from_secs(1)));
        dest.touch();
        assert!(!dest.is_silent(Duration::from_secs(1)));
    }

    #[test]
    fn test_switch_request_taken_once() {
        let table = table();
        table.request_switch(SwitchRequest::To(1));
        assert_eq!(table.pending_request(), SwitchRequest::To(1));
        assert_eq!(table.take_request(), SwitchRequest::To(1));
        assert_eq!(table.take_request(), SwitchRequest::None);
    }

    #[test]
    fn test_position_by_ip() {
        let table = table();
        assert_eq!(table.position_by_ip("10.0.0.2".parse().unwrap()), Some(1));
        assert_eq!(table.position_by_ip("10.0.0.3".parse().unwrap()), None);
    }

    #[test]
    fn test_sender_index_prefers_selection_on_shared_host() {
        let table =
            DestinationTable::new(["10.0.0.1:18324", "10.0.0.1:18326"].map(|a| a.parse().unwrap()));
        let ip = "10.0.0.1".parse().unwrap();
        assert_eq!(table.sender_index(ip), Some(0));

        table.select(1);
        assert_eq!(table.sender_index(ip), Some(1));
        assert_eq!(table.sender_index("10.0.0.2".parse().unwrap()), None);
    }
}
