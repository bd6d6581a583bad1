//! CommandServer - control commands from collector servers
//!
//! Commands are honored only from the selected destination unless accept-all
//! mode is on. `takeOver` and `sendStatus` are answered for any configured
//! destination. Selection changes are only posted here; the failover
//! coordinator carries them out on its next cycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use el_common::{WireFields, MAX_INBOUND_LENGTH, PROTOCOL_VERSION};

use crate::destinations::{DestinationTable, SwitchRequest};
use crate::source::AlarmLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    TakeOver,
    Disconnect,
    SendAllAlarms,
    SendAlarm(Option<&'a str>),
    SendStatus,
    Unknown,
    Missing,
}

impl<'a> Command<'a> {
    pub fn parse(fields: &WireFields<'a>) -> Self {
        match fields.get("COMMAND") {
            None => Command::Missing,
            Some("takeOver") => Command::TakeOver,
            Some("disconnect") => Command::Disconnect,
            Some("sendAllAlarms") => Command::SendAllAlarms,
            Some("sendAlarm") => Command::SendAlarm(fields.get("NAME").filter(|n| !n.is_empty())),
            Some("sendStatus") => Command::SendStatus,
            Some(_) => Command::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Done,
    Ok,
    Error,
    Refused,
    Selected,
    NotSelected,
    CmdUnknown,
    CmdMissing,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Done => "done",
            Reply::Ok => "ok",
            Reply::Error => "error",
            Reply::Refused => "refused",
            Reply::Selected => "selected",
            Reply::NotSelected => "notSelected",
            Reply::CmdUnknown => "cmdUnknown",
            Reply::CmdMissing => "cmdMissing",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStats {
    pub handled: u64,
    /// From addresses that are not configured destinations
    pub ignored: u64,
    pub malformed: u64,
}

pub struct CommandServer {
    destinations: Arc<DestinationTable>,
    alarm_log: Arc<AlarmLog>,
    accept_all: bool,
    handled: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
}

impl CommandServer {
    pub fn new(destinations: Arc<DestinationTable>, alarm_log: Arc<AlarmLog>, accept_all: bool) -> Self {
        Self {
            destinations,
            alarm_log,
            accept_all,
            handled: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Handle one datagram and build the reply, if one is due
    pub fn handle(&self, datagram: &[u8], from: SocketAddr) -> Option<String> {
        let Some(sender) = self.destinations.sender_index(from.ip()) else {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("el_commands_ignored_total").increment(1);
            debug!(from = %from, "Ignoring command from unknown address");
            return None;
        };

        let fields = match WireFields::from_datagram(datagram) {
            Ok(fields) => fields,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(from = %from, error = %e, "Discarding malformed command");
                return None;
            }
        };

        let command = Command::parse(&fields);
        let reply = self.execute(command, sender);

        self.handled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("el_commands_handled_total").increment(1);
        info!(from = %from, command = ?command, reply = reply.as_str(), "Command handled");

        let mut text = String::new();
        if let Some(id) = fields.id() {
            text.push_str(&format!("ID={id};VERSION={PROTOCOL_VERSION};"));
        }
        text.push_str(&format!("REPLY={};", reply.as_str()));
        Some(text)
    }

    fn execute(&self, command: Command<'_>, sender: usize) -> Reply {
        let selected = self.destinations.is_selected(sender);
        let allowed = self.accept_all || selected;

        match command {
            Command::TakeOver => {
                if selected {
                    Reply::Ok
                } else if self.destinations.get(sender).is_some_and(|d| d.is_up()) {
                    self.destinations.request_switch(SwitchRequest::To(sender));
                    Reply::Done
                } else {
                    Reply::Error
                }
            }
            Command::Disconnect => {
                if selected {
                    self.destinations.request_switch(SwitchRequest::AnyOther);
                    Reply::Done
                } else {
                    Reply::Ok
                }
            }
            Command::SendAllAlarms if allowed => {
                self.alarm_log.queue_all();
                Reply::Done
            }
            Command::SendAlarm(Some(name)) if allowed => match self.alarm_log.queue_source(name) {
                Ok(_) => Reply::Done,
                Err(e) => {
                    debug!(name, error = %e, "Cannot queue requested source");
                    Reply::Error
                }
            },
            Command::SendAlarm(None) if allowed => Reply::Error,
            Command::SendAllAlarms | Command::SendAlarm(_) => Reply::Refused,
            Command::SendStatus => {
                if selected {
                    Reply::Selected
                } else {
                    Reply::NotSelected
                }
            }
            Command::Unknown => Reply::CmdUnknown,
            Command::Missing => Reply::CmdMissing,
        }
    }

    pub async fn run(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = [0u8; MAX_INBOUND_LENGTH];
        info!(address = ?socket.local_addr().ok(), accept_all = self.accept_all, "Command server started");

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(reply) = self.handle(&buf[..len], from) {
                            let mut datagram = reply.into_bytes();
                            datagram.push(0);
                            if let Err(e) = socket.send_to(&datagram, from).await {
                                warn!(to = %from, error = %e, "Failed to send command reply");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Command socket receive failed"),
                },
                _ = shutdown.recv() => {
                    info!("Command server shutting down");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> CommandStats {
        CommandStats {
            handled: self.handled.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}
