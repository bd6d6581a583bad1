//! FailoverCoordinator - destination liveness and selection
//!
//! A single periodic task. Each cycle it probes destinations with beacons,
//! then makes sure exactly one reachable destination is selected. A switch
//! is committed only after the new destination acknowledged an announcement.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use el_config::TimingConfig;

use crate::callers::CallerSlot;
use crate::destinations::{DestinationTable, SwitchRequest};
use crate::transport::Transport;

/// Beacon ids are drawn from their own range, far above record ids
const FIRST_BEACON_ID: u64 = 2_000_000_000;

const MIN_CYCLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Requested by a destination (takeover or disconnect)
    SwitchOver,
    /// Chosen by the coordinator
    Selected,
}

impl SwitchReason {
    fn text(&self) -> &'static str {
        match self {
            SwitchReason::SwitchOver => "switchOver",
            SwitchReason::Selected => "selected",
        }
    }
}

pub struct FailoverCoordinator {
    destinations: Arc<DestinationTable>,
    transport: Arc<dyn Transport>,
    caller: Arc<CallerSlot>,
    timing: TimingConfig,
    /// Record header prepended to switch announcements
    header: String,
    beacon_ids: AtomicU64,
    switches: AtomicU64,
}

impl FailoverCoordinator {
    pub fn new(
        destinations: Arc<DestinationTable>,
        transport: Arc<dyn Transport>,
        caller: Arc<CallerSlot>,
        timing: TimingConfig,
        header: String,
    ) -> Self {
        Self {
            destinations,
            transport,
            caller,
            timing,
            header,
            beacon_ids: AtomicU64::new(FIRST_BEACON_ID),
            switches: AtomicU64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            destinations = self.destinations.len(),
            period_ms = self.timing.beacon_period_ms,
            "Failover coordinator started"
        );

        loop {
            let started = Instant::now();
            tokio::select! {
                _ = self.run_cycle() => {}
                _ = shutdown.recv() => break,
            }

            let pause = self
                .timing
                .beacon_period()
                .saturating_sub(started.elapsed())
                .max(MIN_CYCLE_SLEEP);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Failover coordinator shutting down");
    }

    /// One probe pass followed by one selection pass
    pub async fn run_cycle(&self) {
        self.probe_destinations().await;
        self.update_selection().await;
    }

    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    async fn probe_destinations(&self) {
        for (index, dest) in self.destinations.iter() {
            let address = dest.address();

            if dest.is_up() {
                if !dest.is_silent(self.timing.max_silent()) {
                    continue;
                }
                let id = self.next_beacon_id();
                let mut alive = false;
                for _ in 0..self.timing.probe_retries {
                    if self.probe(index, address, id).await {
                        alive = true;
                        break;
                    }
                }
                if alive {
                    dest.touch();
                } else if dest.set_up(false) {
                    metrics::counter!("el_destination_down_total").increment(1);
                    warn!(destination = %address, retries = self.timing.probe_retries, "Destination down");
                }
            } else {
                let id = self.next_beacon_id();
                if self.probe(index, address, id).await {
                    dest.touch();
                    if dest.set_up(true) {
                        metrics::counter!("el_destination_up_total").increment(1);
                        info!(destination = %address, "Destination up");
                    }
                }
            }
        }
    }

    async fn probe(&self, index: usize, address: SocketAddr, id: u64) -> bool {
        let kind = if self.destinations.is_selected(index) {
            "beaconSelected"
        } else {
            "beaconNotSelected"
        };
        let beacon = format!("ID={id};TYPE={kind};");

        match self
            .transport
            .round_trip(&self.caller, address, id, &beacon, self.timing.beacon_reply_timeout())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(destination = %address, id, error = %e, "Beacon failed");
                false
            }
        }
    }

    fn next_beacon_id(&self) -> u64 {
        self.beacon_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ========================================================================
    // Selection
    // ========================================================================

    async fn update_selection(&self) {
        match self.destinations.take_request() {
            SwitchRequest::To(index) => {
                self.switch_to(index, SwitchReason::SwitchOver).await;
                return;
            }
            SwitchRequest::AnyOther => {
                match self.find_new() {
                    Some(index) => {
                        self.switch_to(index, SwitchReason::SwitchOver).await;
                    }
                    None => {
                        warn!("No other destination available, releasing selection");
                        self.destinations.clear_selection();
                    }
                }
                return;
            }
            SwitchRequest::None => {}
        }

        let current = self.destinations.selected();
        let healthy = current
            .and_then(|index| self.destinations.get(index))
            .is_some_and(|dest| dest.is_up());
        if healthy {
            return;
        }

        if let Some(index) = current {
            warn!(index, "Selected destination is down, selecting another");
            self.destinations.clear_selection();
        }
        if let Some(index) = self.find_new() {
            self.switch_to(index, SwitchReason::Selected).await;
        }
    }

    /// A random `Up` destination other than the last selected one, else the
    /// last selected one if it is `Up`
    fn find_new(&self) -> Option<usize> {
        let last = self.destinations.last_selected();
        let candidates: Vec<usize> = self
            .destinations
            .iter()
            .filter(|(index, dest)| Some(*index) != last && dest.is_up())
            .map(|(index, _)| index)
            .collect();

        if let Some(&index) = candidates.choose(&mut rand::thread_rng()) {
            return Some(index);
        }
        last.filter(|&index| self.destinations.get(index).is_some_and(|d| d.is_up()))
    }

    async fn switch_to(&self, index: usize, reason: SwitchReason) -> bool {
        let Some(dest) = self.destinations.get(index) else {
            warn!(index, "Switch requested to unknown destination");
            return false;
        };
        let address = dest.address();
        let id = self.transport.next_message_id();
        let announcement = format!("{}ID={id};TYPE=sysMsg;TEXT={};", self.header, reason.text());

        for attempt in 1..=self.timing.announce_retries {
            match self
                .transport
                .round_trip(&self.caller, address, id, &announcement, self.timing.message_reply_timeout())
                .await
            {
                Ok(()) => {
                    dest.touch();
                    dest.set_up(true);
                    self.destinations.select(index);
                    self.switches.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("el_selection_switches_total").increment(1);
                    info!(destination = %address, reason = reason.text(), "Destination selected");
                    return true;
                }
                Err(e) => {
                    debug!(destination = %address, attempt, error = %e, "Switch announcement failed");
                    if attempt < self.timing.announce_retries {
                        tokio::time::sleep(self.timing.retry_wait()).await;
                    }
                }
            }
        }

        warn!(destination = %address, "Destination did not acknowledge switch");
        false
    }
}
