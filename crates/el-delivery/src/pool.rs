//! SenderPool - workers that drain the event ring
//!
//! Each worker waits for the drain signal, takes one event, and passes the
//! signal on if more are pending so idle siblings join in on a backlog.
//! The formatted record is then retried until acknowledged.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use el_ring::{Drained, EventStore};

use crate::callers::{CallerSlot, CallerTable};
use crate::delivery::{Deliverer, DeliveryOutcome};
use crate::format::RecordFormatter;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub workers: usize,
    pub active: u32,
    pub delivered: u64,
    pub retries: u64,
    pub format_errors: u64,
    pub dropped: u64,
}

pub struct SenderPool {
    store: Arc<EventStore>,
    formatter: Arc<RecordFormatter>,
    deliverer: Arc<Deliverer>,
    callers: Arc<CallerTable>,
    init_wait: Duration,
    running: AtomicBool,
    /// Workers currently handling a record
    active: AtomicU32,
    format_errors: AtomicU64,
    /// Events abandoned because not even the placeholder fit
    dropped: AtomicU64,
}

impl SenderPool {
    pub fn new(
        store: Arc<EventStore>,
        formatter: Arc<RecordFormatter>,
        deliverer: Arc<Deliverer>,
        callers: Arc<CallerTable>,
        init_wait: Duration,
    ) -> Self {
        Self {
            store,
            formatter,
            deliverer,
            callers,
            init_wait,
            running: AtomicBool::new(false),
            active: AtomicU32::new(0),
            format_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Spawn one task per caller slot reserved for senders
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sender pool already running");
            return Vec::new();
        }

        let workers = self.callers.sender_workers();
        info!(workers, init_wait_ms = self.init_wait.as_millis() as u64, "Starting sender pool");

        (0..workers)
            .map(|worker| {
                let pool = self.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move { pool.worker_loop(worker, shutdown_rx).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: broadcast::Receiver<()>) {
        let caller = self.callers.sender(worker);

        // Let start-up snapshots collapse before anything is sent
        tokio::select! {
            _ = tokio::time::sleep(self.init_wait) => {}
            _ = shutdown.recv() => {
                debug!(worker, "Sender stopped during initial wait");
                return;
            }
        }

        loop {
            tokio::select! {
                _ = self.store.wait_for_events() => {}
                _ = shutdown.recv() => break,
            }

            let Some(drained) = self.store.read() else {
                continue;
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            let outcome = self.process(worker, &caller, drained, &mut shutdown).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if outcome == Some(DeliveryOutcome::Stopped) {
                break;
            }
        }

        debug!(worker, "Sender shutting down");
    }

    /// Format and deliver one drained event. Returns `None` if the event
    /// could not be formatted at all.
    pub async fn process(
        &self,
        worker: usize,
        caller: &CallerSlot,
        drained: Drained,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<DeliveryOutcome> {
        if drained.more_pending {
            self.store.signal_drain();
        }

        let id = self.deliverer.transport().next_message_id();
        let record = match self.formatter.format_event(id, &drained.record, &self.store) {
            Ok(record) => record,
            Err(e) => {
                self.format_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("el_format_errors_total").increment(1);
                warn!(worker, source = %drained.record.event.source.name, error = %e, "Record does not fit, sending placeholder");
                match self.formatter.placeholder(id) {
                    Some(placeholder) => placeholder,
                    None => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        error!(worker, "Record header leaves no room for any message, event dropped");
                        return None;
                    }
                }
            }
        };

        let outcome = self.deliverer.deliver(caller, id, &record, shutdown).await;
        if let DeliveryOutcome::Delivered { destination, attempts } = outcome {
            debug!(worker, id, destination, attempts, "Record delivered");
        }
        Some(outcome)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            workers: self.callers.sender_workers(),
            active: self.active.load(Ordering::SeqCst),
            delivered: self.deliverer.delivered(),
            retries: self.deliverer.retries(),
            format_errors: self.format_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
