use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use el_config::ConfigError;

/// Failure of one request/reply round trip. Always retried by the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send to {destination} failed: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no reply from {destination} within {timeout:?}")]
    Timeout {
        destination: SocketAddr,
        timeout: Duration,
    },

    #[error("{destination} did not accept message {id}")]
    Rejected { destination: SocketAddr, id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("client already started")]
    AlreadyStarted,

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("alarm logging is disabled")]
    Disabled,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
