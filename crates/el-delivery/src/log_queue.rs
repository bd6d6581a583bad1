//! Auxiliary log queues
//!
//! System and sequencer log lines are formatted when logged and queued as
//! finished records. Logging never blocks: a full queue drops the line and
//! counts it, and the next line that gets queued reports the count. A drain
//! task per queue appends the message id and delivers like a sender worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use el_common::{event_time, truncate_chars, MAX_RECORD_LENGTH};

use crate::callers::CallerSlot;
use crate::delivery::{Deliverer, DeliveryOutcome};

/// Room kept free for the `ID=<n>;` appended at send time
const ROOM_ID: usize = 15;

/// Longest record prefix that still leaves room for the text
const MAX_PREFIX_LENGTH: usize = 250;

/// Longest sequencer text before it is cut
const MAX_SEQUENCER_TEXT: usize = 255;
const TRUNCATION_MARK: &str = "<<TRUNCATED>>";

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogQueueStats {
    pub pending: usize,
    pub lost: u64,
    pub lost_total: u64,
    pub capacity: usize,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct LossCounters {
    lost: u64,
    lost_total: u64,
}

struct LogQueue {
    name: &'static str,
    header: String,
    capacity: usize,
    enabled: AtomicBool,
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    counters: Mutex<LossCounters>,
}

impl LogQueue {
    fn new(name: &'static str, header: String, capacity: usize, enabled: bool) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            header,
            capacity,
            enabled: AtomicBool::new(enabled),
            tx,
            rx: Mutex::new(Some(rx)),
            counters: Mutex::new(LossCounters::default()),
        }
    }

    /// Build a record with the pending loss count and queue it
    fn enqueue_with(&self, build: impl FnOnce(u64) -> String) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }

        let mut counters = self.counters.lock();
        let record = build(counters.lost);
        match self.tx.try_send(record) {
            Ok(()) => {
                counters.lost = 0;
                true
            }
            Err(_) => {
                counters.lost += 1;
                counters.lost_total += 1;
                metrics::counter!("el_log_queue_dropped_total", "queue" => self.name).increment(1);
                false
            }
        }
    }

    async fn drain(
        &self,
        deliverer: &Deliverer,
        caller: &CallerSlot,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!(queue = self.name, "Log queue drain already running");
            return;
        };
        info!(queue = self.name, capacity = self.capacity, "Log queue drain started");

        loop {
            let record = tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            let id = deliverer.transport().next_message_id();
            let text = format!("{record}ID={id};");
            match deliverer.deliver(caller, id, &text, &mut shutdown).await {
                DeliveryOutcome::Delivered { destination, .. } => {
                    debug!(queue = self.name, id, destination, "Log record delivered");
                }
                DeliveryOutcome::Stopped => break,
            }
        }

        *self.rx.lock() = Some(rx);
        info!(queue = self.name, "Log queue drain shutting down");
    }

    fn budget(&self) -> usize {
        MAX_RECORD_LENGTH.saturating_sub(ROOM_ID)
    }

    /// `TEXT=<text>;` after `prefix`, cut to the record budget
    fn finish(&self, mut record: String, text: &str) -> String {
        if record.len() > MAX_PREFIX_LENGTH {
            record.push_str("TEXT=header is too long;");
            return record;
        }
        let room = self.budget().saturating_sub(record.len() + "TEXT=;".len());
        record.push_str("TEXT=");
        record.push_str(&truncate_bytes(text, room).replace(';', ","));
        record.push(';');
        record
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stats(&self) -> LogQueueStats {
        let counters = self.counters.lock();
        LogQueueStats {
            pending: self.capacity.saturating_sub(self.tx.capacity()),
            lost: counters.lost,
            lost_total: counters.lost_total,
            capacity: self.capacity,
            enabled: self.enabled.load(Ordering::SeqCst),
        }
    }
}

/// Longest prefix of `text` within `max` bytes, on a char boundary
fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// System Log
// ============================================================================

pub struct SystemLog {
    queue: LogQueue,
}

impl SystemLog {
    pub fn new(header: impl Into<String>, capacity: usize, enabled: bool) -> Self {
        Self {
            queue: LogQueue::new("system", header.into(), capacity, enabled),
        }
    }

    /// Queue one line; false if it was dropped or logging is off
    pub fn log(&self, text: &str) -> bool {
        let now = Utc::now();
        self.queue.enqueue_with(|lost| {
            let mut record = format!(
                "{}APPLICATION-ID=sysMsgLog;TYPE=sysLog;EVENTTIME={};",
                self.queue.header,
                event_time(&now)
            );
            if lost > 0 {
                record.push_str(&format!("sysMsgLost={lost};"));
            }
            self.queue.finish(record, text)
        })
    }

    pub async fn run(
        self: Arc<Self>,
        deliverer: Arc<Deliverer>,
        caller: Arc<CallerSlot>,
        shutdown: broadcast::Receiver<()>,
    ) {
        self.queue.drain(&deliverer, &caller, shutdown).await;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.queue.set_enabled(enabled);
    }

    pub fn stats(&self) -> LogQueueStats {
        self.queue.stats()
    }
}

// ============================================================================
// Sequencer Log
// ============================================================================

pub struct SequencerLog {
    queue: LogQueue,
    /// Timestamps handed out are strictly increasing
    last_time: Mutex<DateTime<Utc>>,
}

impl SequencerLog {
    pub fn new(header: impl Into<String>, capacity: usize, enabled: bool) -> Self {
        Self {
            queue: LogQueue::new("sequencer", header.into(), capacity, enabled),
            last_time: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn log(&self, task_name: &str, text: &str) -> bool {
        let now = self.next_timestamp();
        let text = clip_sequencer_text(text);

        self.queue.enqueue_with(|lost| {
            let mut record = format!(
                "{}APPLICATION-ID=snlMsgLog;TYPE=snlLog;EVENTTIME={};NAME={};",
                self.queue.header,
                event_time(&now),
                task_name.replace(';', ",")
            );
            if lost > 0 {
                record.push_str(&format!("snlMsgLost={lost};"));
            }
            self.queue.finish(record, &text)
        })
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_time.lock();
        let now = Utc::now();
        let stamp = if now > *last {
            now
        } else {
            *last + ChronoDuration::milliseconds(1)
        };
        *last = stamp;
        stamp
    }

    pub async fn run(
        self: Arc<Self>,
        deliverer: Arc<Deliverer>,
        caller: Arc<CallerSlot>,
        shutdown: broadcast::Receiver<()>,
    ) {
        self.queue.drain(&deliverer, &caller, shutdown).await;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.queue.set_enabled(enabled);
    }

    pub fn stats(&self) -> LogQueueStats {
        self.queue.stats()
    }
}

fn clip_sequencer_text(text: &str) -> String {
    if text.chars().count() <= MAX_SEQUENCER_TEXT {
        return text.to_string();
    }
    let keep = MAX_SEQUENCER_TEXT - TRUNCATION_MARK.len();
    format!("{}{TRUNCATION_MARK}", truncate_chars(text, keep))
}
