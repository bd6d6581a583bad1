//! ReplyRouter - demultiplexes acknowledgments to waiting callers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use el_common::{WireFields, MAX_INBOUND_LENGTH};

use crate::callers::CallerTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the caller at this table index
    Delivered(usize),
    /// No caller is waiting for this id from this address
    Unmatched,
    /// Not text, or no parseable `ID`
    Malformed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplyRouterStats {
    pub routed: u64,
    pub unmatched: u64,
    pub malformed: u64,
}

pub struct ReplyRouter {
    callers: Arc<CallerTable>,
    routed: AtomicU64,
    unmatched: AtomicU64,
    malformed: AtomicU64,
}

impl ReplyRouter {
    pub fn new(callers: Arc<CallerTable>) -> Self {
        Self {
            callers,
            routed: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Match one inbound datagram against the caller table
    pub fn route(&self, datagram: &[u8], from: SocketAddr) -> RouteOutcome {
        let parsed = WireFields::from_datagram(datagram)
            .ok()
            .and_then(|fields| fields.id().map(|id| (id, fields.reply_ok())));

        let Some((id, ok)) = parsed else {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("el_replies_malformed_total").increment(1);
            debug!(from = %from, "Discarding malformed reply");
            return RouteOutcome::Malformed;
        };

        for (index, slot) in self.callers.iter().enumerate() {
            if slot.complete(from, id, ok) {
                self.routed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("el_replies_routed_total").increment(1);
                return RouteOutcome::Delivered(index);
            }
        }

        self.unmatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("el_replies_unmatched_total").increment(1);
        debug!(from = %from, id, "No caller waiting for reply");
        RouteOutcome::Unmatched
    }

    pub async fn run(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = [0u8; MAX_INBOUND_LENGTH];
        info!(address = ?socket.local_addr().ok(), "Reply router started");

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.route(&buf[..len], from);
                    }
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        warn!(error = %e, "Reply socket receive failed");
                    }
                },
                _ = shutdown.recv() => {
                    info!("Reply router shutting down");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> ReplyRouterStats {
        ReplyRouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_routes_to_matching_sender() {
        let callers = Arc::new(CallerTable::new(2));
        let router = ReplyRouter::new(callers.clone());

        let beacon_rx = callers.beacon().arm(2_000_000_001, addr("10.0.0.1:18324"));
        let sender_rx = callers.sender(1).arm(17, addr("10.0.0.1:18324"));

        let outcome = router.route(b"ID=17;REPLY=Ok;\0", addr("10.0.0.1:18324"));
        assert_eq!(outcome, RouteOutcome::Delivered(2));
        assert!(sender_rx.await.unwrap());
        assert!(callers.beacon().is_waiting());

        let outcome = router.route(b"STATUS=Ok;ID=2000000001;", addr("10.0.0.1:5000"));
        assert_eq!(outcome, RouteOutcome::Delivered(0));
        assert!(beacon_rx.await.unwrap());
    }

    #[test]
    fn test_unmatched_and_malformed_are_counted() {
        let callers = Arc::new(CallerTable::new(1));
        let router = ReplyRouter::new(callers.clone());
        let _rx = callers.sender(0).arm(3, addr("10.0.0.1:18324"));

        assert_eq!(router.route(b"ID=3;REPLY=Ok;", addr("10.0.0.9:18324")), RouteOutcome::Unmatched);
        assert_eq!(router.route(b"ID=4;REPLY=Ok;", addr("10.0.0.1:18324")), RouteOutcome::Unmatched);
        assert_eq!(router.route(b"REPLY=Ok;", addr("10.0.0.1:18324")), RouteOutcome::Malformed);
        assert_eq!(router.route(&[0xff, 0x00], addr("10.0.0.1:18324")), RouteOutcome::Malformed);

        let stats = router.stats();
        assert_eq!(stats.routed, 0);
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.malformed, 2);
        assert!(callers.sender(0).is_waiting());
    }

    #[tokio::test]
    async fn test_rejected_reply_wakes_with_failure() {
        let callers = Arc::new(CallerTable::new(1));
        let router = ReplyRouter::new(callers.clone());
        let rx = callers.sender(0).arm(9, addr("10.0.0.1:18324"));

        assert_eq!(
            router.route(b"ID=9;REPLY=error;", addr("10.0.0.1:18324")),
            RouteOutcome::Delivered(1)
        );
        assert!(!rx.await.unwrap());
    }
}
