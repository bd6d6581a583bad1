//! Status report - a serialisable snapshot of the client

use std::net::SocketAddr;

use serde::Serialize;

use el_config::TimingConfig;
use el_ring::StoreStats;

use crate::command::CommandStats;
use crate::log_queue::LogQueueStats;
use crate::pool::SenderStats;
use crate::reply_router::ReplyRouterStats;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub running: bool,
    pub destinations: Vec<DestinationReport>,
    pub message_port: u16,
    pub command_port: u16,
    pub reply_address: Option<SocketAddr>,
    pub selection_switches: u64,
    pub timing: TimingConfig,
    pub ring: RingReport,
    pub senders: SenderStats,
    pub replies: ReplyRouterStats,
    pub commands: CommandStats,
    pub system_log: LogQueueStats,
    pub sequencer_log: LogQueueStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationReport {
    pub address: SocketAddr,
    pub online: bool,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingReport {
    #[serde(flatten)]
    pub stats: StoreStats,
    pub alarm_log_enabled: bool,
}

impl StatusReport {
    pub fn selected(&self) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| d.selected)
    }

    pub fn online_count(&self) -> usize {
        self.destinations.iter().filter(|d| d.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> StatusReport {
        StatusReport {
            version: "0.1.0",
            protocol_version: el_common::PROTOCOL_VERSION,
            running: true,
            destinations: vec![
                DestinationReport {
                    address: "10.0.0.1:18324".parse().unwrap(),
                    online: true,
                    selected: true,
                },
                DestinationReport {
                    address: "10.0.0.2:18324".parse().unwrap(),
                    online: false,
                    selected: false,
                },
            ],
            message_port: 18324,
            command_port: 18325,
            reply_address: None,
            selection_switches: 1,
            timing: TimingConfig::default(),
            ring: RingReport {
                stats: StoreStats::default(),
                alarm_log_enabled: true,
            },
            senders: SenderStats::default(),
            replies: ReplyRouterStats::default(),
            commands: CommandStats::default(),
            system_log: LogQueueStats::default(),
            sequencer_log: LogQueueStats::default(),
        }
    }

    #[test]
    fn test_selection_helpers() {
        let report = report();
        assert_eq!(report.online_count(), 1);
        assert_eq!(
            report.selected().map(|d| d.address),
            Some("10.0.0.1:18324".parse().unwrap())
        );
    }

    #[test]
    fn test_ring_stats_are_flattened() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["ring"]["alarm_log_enabled"], true);
        assert_eq!(json["ring"]["pending"], 0);
        assert_eq!(json["destinations"][1]["online"], false);
        assert_eq!(json["protocol_version"], "0.5");
    }
}
