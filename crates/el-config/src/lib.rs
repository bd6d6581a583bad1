//! Event-log client configuration
//!
//! Configuration is read once at start-up as a flat object:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment overrides (see [`env`])
//!
//! There is no dynamic reconfiguration.

pub mod env;

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use el_common::{ValueKind, MAX_HEADER_LENGTH};

pub const DEFAULT_MESSAGE_PORT: u16 = 18324;
pub const DEFAULT_COMMAND_PORT: u16 = 18325;

/// The reply socket binds this far above the message port so a client and
/// a server on the same host do not receive each other's traffic
pub const REPLY_PORT_OFFSET: u16 = 10;

/// Most destinations that are ever configured
pub const SERVERS_MAX: usize = 6;

const DEFAULT_SENDER_WORKERS: usize = 5;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const MIN_RETRY_WAIT_MS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Destination servers, `host` or `host:port`, in priority order
    pub destinations: Vec<String>,
    pub message_port: u16,
    pub command_port: u16,
    /// Local port for the reply socket; defaults to message port + 10
    pub reply_port: Option<u16>,
    pub bind_address: String,
    /// Honor replay commands from every destination, not only the active one
    pub accept_all_commands: bool,
    pub ioc_name: Option<String>,
    pub physical_host: Option<String>,
    pub facility: Option<String>,
    pub timing: TimingConfig,
    pub store: StoreConfig,
    pub classes: ClassConfig,
    /// Monitored points served by the built-in value source
    pub points: Vec<PointConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            message_port: DEFAULT_MESSAGE_PORT,
            command_port: DEFAULT_COMMAND_PORT,
            reply_port: None,
            bind_address: "0.0.0.0".to_string(),
            accept_all_commands: false,
            ioc_name: None,
            physical_host: None,
            facility: None,
            timing: TimingConfig::default(),
            store: StoreConfig::default(),
            classes: ClassConfig::default(),
            points: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before workers start draining, so start-up snapshots collapse
    pub init_wait_ms: u64,
    pub beacon_period_ms: u64,
    /// An `Up` destination silent for longer than this is probed
    pub max_silent_ms: u64,
    pub beacon_reply_timeout_ms: u64,
    pub message_reply_timeout_ms: u64,
    pub retry_wait_ms: u64,
    /// Consecutive failed probes before a destination is marked down
    pub probe_retries: u32,
    pub announce_retries: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_wait_ms: 15_000,
            beacon_period_ms: 3_000,
            max_silent_ms: 2_500,
            beacon_reply_timeout_ms: 600,
            message_reply_timeout_ms: 1_000,
            retry_wait_ms: MIN_RETRY_WAIT_MS,
            probe_retries: 8,
            announce_retries: 5,
        }
    }
}

impl TimingConfig {
    pub fn init_wait(&self) -> Duration {
        Duration::from_millis(self.init_wait_ms)
    }

    pub fn beacon_period(&self) -> Duration {
        Duration::from_millis(self.beacon_period_ms)
    }

    pub fn max_silent(&self) -> Duration {
        Duration::from_millis(self.max_silent_ms)
    }

    pub fn beacon_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.beacon_reply_timeout_ms)
    }

    pub fn message_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.message_reply_timeout_ms)
    }

    /// Retry wait with its floor applied
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms.max(MIN_RETRY_WAIT_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Distinct sources expected; sizes the ring. Defaults to the value source's count.
    pub expected_sources: Option<usize>,
    pub sender_workers: usize,
    /// Record types never logged
    pub excluded_record_types: Vec<String>,
    /// Record types whose unsigned-short values render as bit groups
    pub bitwise_record_types: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expected_sources: None,
            sender_workers: DEFAULT_SENDER_WORKERS,
            excluded_record_types: vec!["arch".to_string()],
            bitwise_record_types: vec!["mbbiDirect".to_string(), "mbboDirect".to_string()],
        }
    }
}

/// Enable flags per event class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassConfig {
    pub alarm_log: bool,
    pub system_log: bool,
    pub sequencer_log: bool,
    pub queue_capacity: usize,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            alarm_log: true,
            system_log: true,
            sequencer_log: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub kind: ValueKind,
    #[serde(default)]
    pub enum_labels: Vec<String>,
}

// ============================================================================
// Loading
// ============================================================================

impl ClientConfig {
    /// Defaults, then the file (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), destinations = config.destinations.len(), "Loaded configuration file");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(ConfigError::invalid("no destination configured"));
        }
        if self.store.sender_workers == 0 {
            return Err(ConfigError::invalid("sender_workers must be at least 1"));
        }
        if self.timing.beacon_period_ms == 0 {
            return Err(ConfigError::invalid("beacon_period_ms must be positive"));
        }
        if self.classes.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity must be positive"));
        }
        let header = self.message_header();
        if header.len() >= MAX_HEADER_LENGTH {
            return Err(ConfigError::invalid(format!(
                "record header is {} bytes, limit is {}",
                header.len(),
                MAX_HEADER_LENGTH - 1
            )));
        }
        Ok(())
    }

    /// Resolve destination entries to socket addresses.
    ///
    /// Entries past [`SERVERS_MAX`] are ignored and unresolvable entries are
    /// skipped, each with a warning. Fails only when nothing resolves.
    pub fn resolve_destinations(&self) -> Result<Vec<SocketAddr>> {
        if self.destinations.len() > SERVERS_MAX {
            warn!(
                configured = self.destinations.len(),
                max = SERVERS_MAX,
                "Too many destinations, ignoring the excess"
            );
        }

        let mut resolved = Vec::new();
        for entry in self.destinations.iter().take(SERVERS_MAX) {
            match resolve_entry(entry, self.message_port) {
                Ok(addr) => resolved.push(addr),
                Err(e) => warn!(entry = %entry, error = %e, "Skipping unresolvable destination"),
            }
        }

        if resolved.is_empty() {
            return Err(ConfigError::invalid("no destination could be resolved"));
        }
        Ok(resolved)
    }

    /// Fixed prefix of every data record
    pub fn message_header(&self) -> String {
        let mut header = String::new();
        if let Some(name) = &self.ioc_name {
            header.push_str(&format!("HOST={name};"));
        }
        header.push_str(&format!("HOST-PHYS={};", self.physical_host()));
        if let Some(facility) = &self.facility {
            header.push_str(&format!("FACILITY={facility};"));
        }
        header
    }

    pub fn physical_host(&self) -> String {
        self.physical_host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn reply_bind_address(&self) -> String {
        let port = self
            .reply_port
            .unwrap_or_else(|| self.message_port.saturating_add(REPLY_PORT_OFFSET));
        format!("{}:{}", self.bind_address, port)
    }

    pub fn command_bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.command_port)
    }
}

fn resolve_entry(entry: &str, default_port: u16) -> io::Result<SocketAddr> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let mut candidates = if entry.contains(':') {
        entry.to_socket_addrs()?
    } else {
        (entry, default_port).to_socket_addrs()?
    };
    candidates
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address"))
}
