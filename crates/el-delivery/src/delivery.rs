//! Deliverer - the retry loop shared by sender workers and log drains
//!
//! A record that has left its queue is retried against whatever destination
//! is selected at each attempt, until it is acknowledged or the client stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use el_config::TimingConfig;

use crate::callers::CallerSlot;
use crate::destinations::DestinationTable;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { destination: usize, attempts: u32 },
    /// Shutdown was signalled before the record was acknowledged
    Stopped,
}

pub struct Deliverer {
    destinations: Arc<DestinationTable>,
    transport: Arc<dyn Transport>,
    reply_timeout: Duration,
    retry_wait: Duration,
    idle_wait: Duration,
    delivered: AtomicU64,
    retries: AtomicU64,
}

impl Deliverer {
    pub fn new(
        destinations: Arc<DestinationTable>,
        transport: Arc<dyn Transport>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            destinations,
            transport,
            reply_timeout: timing.message_reply_timeout(),
            retry_wait: timing.retry_wait(),
            idle_wait: timing.beacon_period(),
            delivered: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn deliver(
        &self,
        caller: &CallerSlot,
        id: u64,
        record: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> DeliveryOutcome {
        let mut attempts = 0u32;

        loop {
            let (index, address) = match self.destinations.selected_address() {
                Some(selected) => selected,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_wait) => {}
                        _ = shutdown.recv() => return DeliveryOutcome::Stopped,
                    }
                    continue;
                }
            };

            attempts += 1;
            let result = tokio::select! {
                result = self.transport.round_trip(caller, address, id, record, self.reply_timeout) => result,
                _ = shutdown.recv() => {
                    caller.disarm();
                    return DeliveryOutcome::Stopped;
                }
            };

            match result {
                Ok(()) => {
                    if let Some(dest) = self.destinations.get(index) {
                        dest.touch();
                    }
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("el_records_delivered_total").increment(1);
                    return DeliveryOutcome::Delivered {
                        destination: index,
                        attempts,
                    };
                }
                Err(e) => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("el_delivery_retries_total").increment(1);
                    debug!(caller = caller.name(), id, attempt = attempts, error = %e, "Delivery attempt failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_wait) => {}
                        _ = shutdown.recv() => return DeliveryOutcome::Stopped,
                    }
                }
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}
