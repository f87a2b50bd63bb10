//! Ring configuration
//!
//! Grouped the same way the node is built: identity and seeds, network
//! transport, failure detection and the discovery engine itself. Every
//! section deserializes from TOML with defaults for missing keys; durations
//! are written in milliseconds.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::NodeId;

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Node identity and seeds
    pub node: NodeConfig,
    /// Transport settings
    pub network: NetworkConfig,
    /// Heartbeat and probe settings
    pub failure_detection: FailureDetectionConfig,
    /// History, discard and join settings
    pub discovery: DiscoveryConfig,
}

impl RingConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> DiscoveryResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DiscoveryError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DiscoveryResult<Self> {
        let config: RingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> DiscoveryResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> DiscoveryResult<()> {
        let fd = &self.failure_detection;
        if fd.suspect_threshold < 2 {
            return Err(DiscoveryError::Configuration(
                "suspect_threshold must be at least 2 heartbeats".to_string(),
            ));
        }
        if fd.heartbeat_interval.is_zero() {
            return Err(DiscoveryError::Configuration(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        let discovery = &self.discovery;
        if discovery.tick_interval.is_zero() {
            return Err(DiscoveryError::Configuration(
                "tick_interval must be positive".to_string(),
            ));
        }
        if fd.probe_grace < discovery.tick_interval {
            return Err(DiscoveryError::Configuration(
                "probe_grace must not be shorter than tick_interval".to_string(),
            ));
        }
        if discovery.history_capacity == 0 || discovery.discard_batch == 0 {
            return Err(DiscoveryError::Configuration(
                "history_capacity and discard_batch must be positive".to_string(),
            ));
        }
        let network = &self.network;
        if network.connect_attempts == 0 {
            return Err(DiscoveryError::Configuration(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if network.inbound_queue == 0 {
            return Err(DiscoveryError::Configuration(
                "inbound_queue must be positive".to_string(),
            ));
        }
        if network.max_frame_size < 1024 {
            return Err(DiscoveryError::Configuration(
                "max_frame_size must be at least 1024 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a ring node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id; a random one is generated when absent
    pub node_id: Option<NodeId>,
    /// Listener address
    pub bind_address: SocketAddr,
    /// Initial contact addresses
    pub seeds: Vec<SocketAddr>,
    /// Attributes published with the node descriptor
    pub attributes: BTreeMap<String, String>,
    /// Start a new ring when no seed answers
    pub allow_bootstrap: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            seeds: Vec::new(),
            attributes: BTreeMap::new(),
            allow_bootstrap: true,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum encoded frame size
    pub max_frame_size: usize,
    /// Connection attempts before a link is declared failed
    pub connect_attempts: u32,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Capacity of the transport to apply-loop queue
    pub inbound_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 4 * 1024 * 1024,
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(100),
            write_timeout: Duration::from_secs(2),
            inbound_queue: 1024,
        }
    }
}

/// Failure detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectionConfig {
    /// Heartbeat interval
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Whole heartbeat intervals missed before a node is suspected
    pub suspect_threshold: u32,
    /// Time a suspect gets to answer a direct probe
    #[serde(with = "millis")]
    pub probe_grace: Duration,
}

impl FailureDetectionConfig {
    /// Silence tolerated before suspicion
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_threshold
    }
}

impl Default for FailureDetectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspect_threshold: 3,
            probe_grace: Duration::from_secs(2),
        }
    }
}

/// Discovery engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Accepted messages between two discards
    pub discard_batch: usize,
    #[serde(with = "millis")]
    pub discard_interval: Duration,
    /// Hard cap on history entries
    pub history_capacity: usize,
    #[serde(with = "millis")]
    pub history_max_age: Duration,
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    /// Give up joining after this many attempts
    pub max_join_attempts: Option<u32>,
    #[serde(with = "millis")]
    pub ensure_delivery_timeout: Duration,
    #[serde(with = "millis")]
    pub resync_timeout: Duration,
    /// Messages parked while waiting for a snapshot
    pub resync_capacity: usize,
    #[serde(with = "millis")]
    pub leave_grace: Duration,
    /// Apply loop timer resolution
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discard_batch: 64,
            discard_interval: Duration::from_secs(5),
            history_capacity: 4096,
            history_max_age: Duration::from_secs(300),
            join_timeout: Duration::from_secs(10),
            max_join_attempts: None,
            ensure_delivery_timeout: Duration::from_secs(5),
            resync_timeout: Duration::from_secs(3),
            resync_capacity: 1024,
            leave_grace: Duration::from_secs(2),
            tick_interval: Duration::from_millis(100),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
