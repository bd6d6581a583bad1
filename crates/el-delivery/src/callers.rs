//! Caller slots
//!
//! Every task that waits for acknowledgments owns one slot: the beacon,
//! each sender worker and each auxiliary log drain. A slot holds at most one
//! outstanding request. The reply router scans the table linearly and wakes
//! the slot whose destination and message id match.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug)]
struct PendingRequest {
    expected_id: u64,
    target: SocketAddr,
    waker: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub struct CallerSlot {
    name: String,
    pending: Mutex<Option<PendingRequest>>,
}

impl CallerSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the slot to a request before it is sent. The receiver yields
    /// whether the reply was OK.
    pub fn arm(&self, expected_id: u64, target: SocketAddr) -> oneshot::Receiver<bool> {
        let (waker, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingRequest {
            expected_id,
            target,
            waker,
        });
        rx
    }

    /// Release the binding after a timeout or send failure
    pub fn disarm(&self) {
        self.pending.lock().take();
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Complete the pending request if it matches. Servers may answer from
    /// another port, so only the address is compared.
    pub fn complete(&self, from: SocketAddr, id: u64, ok: bool) -> bool {
        let mut pending = self.pending.lock();
        let matches = pending
            .as_ref()
            .is_some_and(|p| p.expected_id == id && p.target.ip() == from.ip());
        if !matches {
            return false;
        }
        if let Some(request) = pending.take() {
            let _ = request.waker.send(ok);
        }
        true
    }
}

/// Fixed table of caller slots: beacon, senders, system log, sequencer log
#[derive(Debug)]
pub struct CallerTable {
    slots: Vec<Arc<CallerSlot>>,
    sender_workers: usize,
}

impl CallerTable {
    pub fn new(sender_workers: usize) -> Self {
        let mut slots = Vec::with_capacity(sender_workers + 3);
        slots.push(Arc::new(CallerSlot::new("beacon")));
        for worker in 0..sender_workers {
            slots.push(Arc::new(CallerSlot::new(format!("sender-{worker}"))));
        }
        slots.push(Arc::new(CallerSlot::new("system-log")));
        slots.push(Arc::new(CallerSlot::new("sequencer-log")));
        Self {
            slots,
            sender_workers,
        }
    }

    pub fn beacon(&self) -> Arc<CallerSlot> {
        self.slots[0].clone()
    }

    /// Slot of sender worker `worker`; panics past the configured count
    pub fn sender(&self, worker: usize) -> Arc<CallerSlot> {
        assert!(worker < self.sender_workers, "no caller slot for sender {worker}");
        self.slots[1 + worker].clone()
    }

    pub fn system_log(&self) -> Arc<CallerSlot> {
        self.slots[self.sender_workers + 1].clone()
    }

    pub fn sequencer_log(&self) -> Arc<CallerSlot> {
        self.slots[self.sender_workers + 2].clone()
    }

    pub fn sender_workers(&self) -> usize {
        self.sender_workers
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CallerSlot>> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    #[test]
    fn test_table_layout() {
        let table = CallerTable::new(3);
        assert_eq!(table.len(), 6);
        assert_eq!(table.beacon().name(), "beacon");
        assert_eq!(table.sender(2).name(), "sender-2");
        assert_eq!(table.system_log().name(), "system-log");
        assert_eq!(table.sequencer_log().name(), "sequencer-log");
    }

    #[tokio::test]
    async fn test_complete_matches_ip_and_id() {
        let slot = CallerSlot::new("sender-0");
        let rx = slot.arm(42, addr("10.0.0.1:18324"));

        assert!(!slot.complete(addr("10.0.0.2:18324"), 42, true));
        assert!(!slot.complete(addr("10.0.0.1:18324"), 41, true));
        assert!(slot.is_waiting());

        // reply from another port of the same host
        assert!(slot.complete(addr("10.0.0.1:40000"), 42, true));
        assert!(!slot.is_waiting());
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_not_ok_reply() {
        let slot = CallerSlot::new("beacon");
        let rx = slot.arm(7, addr("10.0.0.1:18324"));
        assert!(slot.complete(addr("10.0.0.1:18324"), 7, false));
        assert!(!rx.await.unwrap());
    }

    #[test]
    fn test_disarmed_slot_ignores_reply() {
        let slot = CallerSlot::new("beacon");
        let _rx = slot.arm(7, addr("10.0.0.1:18324"));
        slot.disarm();
        assert!(!slot.complete(addr("10.0.0.1:18324"), 7, true));
    }
}
