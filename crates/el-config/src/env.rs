//! Environment overrides
//!
//! | Variable                       | Field                 |
//! |--------------------------------|-----------------------|
//! | `EPICS_IOC_LOG_INET_LIST`      | `destinations`        |
//! | `EPICS_IOC_LOG_MSG_PORT`       | `message_port`        |
//! | `EPICS_IOC_LOG_CMD_PORT`       | `command_port`        |
//! | `EPICS_IOC_LOG_CMD_ACCEPT_ALL` | `accept_all_commands` |
//! | `EPICS_IOC_NAME`               | `ioc_name`            |
//! | `EPICS_FACILITY`               | `facility`            |

use tracing::warn;

use crate::{ClientConfig, DEFAULT_COMMAND_PORT, DEFAULT_MESSAGE_PORT};

pub const INET_LIST: &str = "EPICS_IOC_LOG_INET_LIST";
pub const MSG_PORT: &str = "EPICS_IOC_LOG_MSG_PORT";
pub const CMD_PORT: &str = "EPICS_IOC_LOG_CMD_PORT";
pub const CMD_ACCEPT_ALL: &str = "EPICS_IOC_LOG_CMD_ACCEPT_ALL";
pub const IOC_NAME: &str = "EPICS_IOC_NAME";
pub const FACILITY: &str = "EPICS_FACILITY";

/// Ports below this are reserved and rejected
const MIN_PORT: u16 = 1024;

impl ClientConfig {
    /// Apply overrides from `lookup`, normally `std::env::var`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(list) = get(INET_LIST) {
            self.destinations = list.split_whitespace().map(str::to_string).collect();
        }
        if let Some(port) = get(MSG_PORT) {
            self.message_port = parse_port(MSG_PORT, &port, DEFAULT_MESSAGE_PORT);
        }
        if let Some(port) = get(CMD_PORT) {
            self.command_port = parse_port(CMD_PORT, &port, DEFAULT_COMMAND_PORT);
        }
        if let Some(flag) = get(CMD_ACCEPT_ALL) {
            self.accept_all_commands = flag.trim() == "YES";
        }
        if let Some(name) = get(IOC_NAME) {
            self.ioc_name = Some(name);
        }
        if let Some(facility) = get(FACILITY) {
            self.facility = Some(facility);
        }
    }
}

fn parse_port(key: &str, text: &str, default: u16) -> u16 {
    match text.trim().parse::<u16>() {
        Ok(port) if port >= MIN_PORT => port,
        _ => {
            warn!(variable = key, value = text, default, "Invalid port, using default");
            default
        }
    }
}
