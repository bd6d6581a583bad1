//! Event-log delivery
//!
//! This crate provides the tasks that move events from the ring to a
//! collector server:
//! - Transport: the shared outbound socket and message-id serial
//! - ReplyRouter: matches acknowledgments to the caller waiting for them
//! - FailoverCoordinator: beacons, destination liveness and selection
//! - SenderPool: workers that drain the ring, format and deliver records
//! - CommandServer: takeover, disconnect, replay and status commands
//! - SystemLog / SequencerLog: bounded queues for auxiliary log records
//! - AlarmLog: producer facade over the ring and a ValueSource
//! - EventLogClient: owns all of the above and their lifecycle

pub mod callers;
pub mod client;
pub mod command;
pub mod delivery;
pub mod destinations;
pub mod error;
pub mod failover;
pub mod format;
pub mod layer;
pub mod lifecycle;
pub mod log_queue;
pub mod pool;
pub mod reply_router;
pub mod report;
pub mod source;
pub mod transport;

pub use callers::{CallerSlot, CallerTable};
pub use client::EventLogClient;
pub use command::{CommandServer, CommandStats};
pub use delivery::{Deliverer, DeliveryOutcome};
pub use destinations::{DestinationTable, SwitchRequest};
pub use error::{DeliveryError, TransportError};
pub use failover::{FailoverCoordinator, SwitchReason};
pub use format::RecordFormatter;
pub use layer::{SystemLogLayer, SystemLogSink};
pub use lifecycle::TaskRegistry;
pub use log_queue::{LogQueueStats, SequencerLog, SystemLog};
pub use pool::{SenderPool, SenderStats};
pub use reply_router::{ReplyRouter, ReplyRouterStats, RouteOutcome};
pub use report::StatusReport;
pub use source::{AlarmLog, SourceSnapshot, StaticValueSource, ValueSource};
pub use transport::{Transport, UdpTransport};

pub type Result<T> = std::result::Result<T, DeliveryError>;
