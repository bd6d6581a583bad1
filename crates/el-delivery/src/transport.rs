//! Transport - the shared outbound socket
//!
//! One UDP socket carries every outbound datagram (records, beacons and
//! switch announcements) and receives the acknowledgments. It binds a port
//! distinct from the message port so that a collector running on the same
//! host never sees its own traffic echoed back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::callers::CallerSlot;
use crate::error::{DeliveryError, TransportError};

const FIRST_MESSAGE_ID: u64 = 1;

/// Request/reply transmission towards one destination
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next serial id for a record or announcement
    fn next_message_id(&self) -> u64;

    /// Send `record` and wait up to `timeout` for an OK reply carrying `id`
    async fn round_trip(
        &self,
        caller: &CallerSlot,
        destination: SocketAddr,
        id: u64,
        record: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Serializes the act of sending, never the wait for a reply
    send_lock: Mutex<()>,
    next_id: AtomicU64,
    datagrams_sent: AtomicU64,
}

impl UdpTransport {
    pub async fn bind(address: &str) -> Result<Self, DeliveryError> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|source| DeliveryError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local = socket.local_addr().ok();
        info!(address = ?local, "Reply socket bound");
        Ok(Self::from_socket(Arc::new(socket)))
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            send_lock: Mutex::new(()),
            next_id: AtomicU64::new(FIRST_MESSAGE_ID),
            datagrams_sent: AtomicU64::new(0),
        }
    }

    /// The socket replies arrive on, shared with the reply router
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    async fn send(&self, destination: SocketAddr, record: &str) -> std::io::Result<()> {
        let mut datagram = Vec::with_capacity(record.len() + 1);
        datagram.extend_from_slice(record.as_bytes());
        datagram.push(0);

        let _guard = self.send_lock.lock().await;
        self.socket.send_to(&datagram, destination).await?;
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn round_trip(
        &self,
        caller: &CallerSlot,
        destination: SocketAddr,
        id: u64,
        record: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let reply = caller.arm(id, destination);

        if let Err(source) = self.send(destination, record).await {
            caller.disarm();
            return Err(TransportError::Send {
                destination,
                source,
            });
        }
        debug!(caller = caller.name(), destination = %destination, id, "Datagram sent");

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TransportError::Rejected { destination, id }),
            Ok(Err(_)) | Err(_) => {
                caller.disarm();
                Err(TransportError::Timeout {
                    destination,
                    timeout,
                })
            }
        }
    }
}
