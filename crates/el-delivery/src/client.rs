//! EventLogClient - owns every shared resource and the task lifecycle
//!
//! Construction builds the passive state (ring, destination table, caller
//! table, producer facades). `start()` binds the sockets and spawns the
//! tasks; `shutdown()` stops them in reverse order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use el_common::PROTOCOL_VERSION;
use el_config::ClientConfig;
use el_ring::EventStore;

use crate::callers::CallerTable;
use crate::command::{CommandServer, CommandStats};
use crate::delivery::Deliverer;
use crate::destinations::DestinationTable;
use crate::error::DeliveryError;
use crate::failover::FailoverCoordinator;
use crate::format::RecordFormatter;
use crate::lifecycle::TaskRegistry;
use crate::log_queue::{SequencerLog, SystemLog};
use crate::pool::{SenderPool, SenderStats};
use crate::reply_router::{ReplyRouter, ReplyRouterStats};
use crate::report::{DestinationReport, RingReport, StatusReport};
use crate::source::{AlarmLog, ValueSource};
use crate::transport::{Transport, UdpTransport};
use crate::Result;

/// Resources that exist only while the client runs
struct Running {
    tasks: TaskRegistry,
    transport: Arc<UdpTransport>,
    router: Arc<ReplyRouter>,
    command: Arc<CommandServer>,
    pool: Arc<SenderPool>,
    coordinator: Arc<FailoverCoordinator>,
}

pub struct EventLogClient {
    config: ClientConfig,
    store: Arc<EventStore>,
    callers: Arc<CallerTable>,
    destinations: Arc<DestinationTable>,
    formatter: Arc<RecordFormatter>,
    alarm_log: Arc<AlarmLog>,
    system_log: Arc<SystemLog>,
    sequencer_log: Arc<SequencerLog>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl EventLogClient {
    pub fn new(config: ClientConfig, value_source: Arc<dyn ValueSource>) -> Result<Self> {
        config.validate()?;
        let addresses = config.resolve_destinations()?;

        let expected = config
            .store
            .expected_sources
            .unwrap_or_else(|| value_source.count());
        let store = Arc::new(EventStore::new(expected));
        let header = config.message_header();

        let alarm_log = Arc::new(AlarmLog::new(
            store.clone(),
            value_source,
            config.store.excluded_record_types.clone(),
            config.classes.alarm_log,
        ));
        let system_log = Arc::new(SystemLog::new(
            header.clone(),
            config.classes.queue_capacity,
            config.classes.system_log,
        ));
        let sequencer_log = Arc::new(SequencerLog::new(
            header.clone(),
            config.classes.queue_capacity,
            config.classes.sequencer_log,
        ));
        let formatter = Arc::new(RecordFormatter::new(
            header,
            config.store.bitwise_record_types.clone(),
        ));

        info!(
            destinations = addresses.len(),
            sources = expected,
            ring_size = store.geometry().size,
            workers = config.store.sender_workers,
            "Event-log client created"
        );

        Ok(Self {
            callers: Arc::new(CallerTable::new(config.store.sender_workers)),
            destinations: Arc::new(DestinationTable::new(addresses)),
            config,
            store,
            formatter,
            alarm_log,
            system_log,
            sequencer_log,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Bind the sockets and start every task. A client is started at most once.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::AlreadyStarted);
        }

        match self.spawn_tasks().await {
            Ok(running) => {
                *self.running.lock() = Some(running);
                info!(version = PROTOCOL_VERSION, "Event-log client started");
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn spawn_tasks(&self) -> Result<Running> {
        // Sockets first: a bind failure leaves nothing running
        let transport = Arc::new(UdpTransport::bind(&self.config.reply_bind_address()).await?);
        let command_address = self.config.command_bind_address();
        let command_socket = Arc::new(UdpSocket::bind(&command_address).await.map_err(|source| {
            DeliveryError::Bind {
                address: command_address.clone(),
                source,
            }
        })?);
        info!(address = %command_address, "Command socket bound");

        let shared: Arc<dyn Transport> = transport.clone();
        let mut tasks = TaskRegistry::new();

        let router = Arc::new(ReplyRouter::new(self.callers.clone()));
        {
            let router = router.clone();
            let socket = transport.socket();
            tasks.spawn("reply-router", move |shutdown| router.run(socket, shutdown));
        }

        let command = Arc::new(CommandServer::new(
            self.destinations.clone(),
            self.alarm_log.clone(),
            self.config.accept_all_commands,
        ));
        {
            let command = command.clone();
            tasks.spawn("command-server", move |shutdown| command.run(command_socket, shutdown));
        }

        let coordinator = Arc::new(FailoverCoordinator::new(
            self.destinations.clone(),
            shared.clone(),
            self.callers.beacon(),
            self.config.timing.clone(),
            self.formatter.header().to_string(),
        ));
        {
            let coordinator = coordinator.clone();
            tasks.spawn("failover", move |shutdown| coordinator.run(shutdown));
        }

        let queued = self.alarm_log.queue_all();
        debug!(queued, "Start-up snapshot queued");

        let pool = Arc::new(SenderPool::new(
            self.store.clone(),
            self.formatter.clone(),
            Arc::new(Deliverer::new(self.destinations.clone(), shared.clone(), &self.config.timing)),
            self.callers.clone(),
            self.config.timing.init_wait(),
        ));
        let workers = pool.start(tasks.sender());
        tasks.extend("sender", workers);

        {
            let log = self.system_log.clone();
            let deliverer = Arc::new(Deliverer::new(self.destinations.clone(), shared.clone(), &self.config.timing));
            let caller = self.callers.system_log();
            tasks.spawn("system-log", move |shutdown| log.run(deliverer, caller, shutdown));
        }
        {
            let log = self.sequencer_log.clone();
            let deliverer = Arc::new(Deliverer::new(self.destinations.clone(), shared, &self.config.timing));
            let caller = self.callers.sequencer_log();
            tasks.spawn("sequencer-log", move |shutdown| log.run(deliverer, caller, shutdown));
        }

        Ok(Running {
            tasks,
            transport,
            router,
            command,
            pool,
            coordinator,
        })
    }

    /// Stop producers and every task. A no-op if the client is not running.
    pub async fn shutdown(&self, timeout_per_task: Duration) {
        let Some(running) = self.running.lock().take() else {
            debug!("Shutdown requested but client is not running");
            return;
        };

        self.alarm_log.set_enabled(false);
        self.system_log.set_enabled(false);
        self.sequencer_log.set_enabled(false);

        running.tasks.shutdown(timeout_per_task).await;
        info!(
            pending = self.store.pending(),
            delivered = running.pool.stats().delivered,
            "Event-log client stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn report(&self) -> StatusReport {
        let running = self.running.lock();
        let selected = self.destinations.selected();

        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: PROTOCOL_VERSION,
            running: running.is_some(),
            destinations: self
                .destinations
                .iter()
                .map(|(index, dest)| DestinationReport {
                    address: dest.address(),
                    online: dest.is_up(),
                    selected: selected == Some(index),
                })
                .collect(),
            message_port: self.config.message_port,
            command_port: self.config.command_port,
            reply_address: running.as_ref().and_then(|r| r.transport.local_addr()),
            selection_switches: running.as_ref().map_or(0, |r| r.coordinator.switches()),
            timing: self.config.timing.clone(),
            ring: RingReport {
                stats: self.store.stats(),
                alarm_log_enabled: self.alarm_log.is_enabled(),
            },
            senders: running
                .as_ref()
                .map(|r| r.pool.stats())
                .unwrap_or_else(|| SenderStats {
                    workers: self.callers.sender_workers(),
                    ..SenderStats::default()
                }),
            replies: running
                .as_ref()
                .map(|r| r.router.stats())
                .unwrap_or_else(ReplyRouterStats::default),
            commands: running
                .as_ref()
                .map(|r| r.command.stats())
                .unwrap_or_else(CommandStats::default),
            system_log: self.system_log.stats(),
            sequencer_log: self.sequencer_log.stats(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn destinations(&self) -> &Arc<DestinationTable> {
        &self.destinations
    }

    pub fn alarm_log(&self) -> &Arc<AlarmLog> {
        &self.alarm_log
    }

    pub fn system_log(&self) -> &Arc<SystemLog> {
        &self.system_log
    }

    pub fn sequencer_log(&self) -> &Arc<SequencerLog> {
        &self.sequencer_log
    }
}
