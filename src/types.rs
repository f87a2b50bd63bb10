//! Core types for the ring discovery protocol
//!
//! Node and message identities plus the descriptor every ring member keeps
//! about every other member.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// First eight hex digits, handy in log lines
    pub fn short(&self) -> String {
        let mut text = self.0.simple().to_string();
        text.truncate(8);
        text
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top bit of the sequence half marks ids handed out for point-to-point
/// messages (join requests). Ring gap detection only looks at the rest.
const DIRECT_FLAG: u64 = 1 << 63;

/// 128-bit message identifier: origin tag of the creator plus a
/// per-creator sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    origin: u64,
    seq: u64,
}

impl MessageId {
    /// Identifier for a ring message with the given per-creator sequence
    pub fn new(creator: NodeId, seq: u64) -> Self {
        Self {
            origin: (creator.as_u128() >> 64) as u64,
            seq: seq & !DIRECT_FLAG,
        }
    }

    /// Identifier for a message that never circulates the ring
    pub fn direct(creator: NodeId, seq: u64) -> Self {
        Self {
            origin: (creator.as_u128() >> 64) as u64,
            seq: seq | DIRECT_FLAG,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq & !DIRECT_FLAG
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn is_direct(&self) -> bool {
        self.seq & DIRECT_FLAG != 0
    }

    pub fn as_u128(&self) -> u128 {
        ((self.origin as u128) << 64) | self.seq as u128
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            origin: (value >> 64) as u64,
            seq: value as u64,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_direct() {
            write!(f, "{:016x}-d{}", self.origin, self.seq())
        } else {
            write!(f, "{:016x}-{}", self.origin, self.seq)
        }
    }
}

/// Membership state of a node as seen by the local topology store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Candidate that has not been admitted yet
    Joining,
    /// Admitted ring member
    Alive,
    /// Announced a graceful leave
    Leaving,
    /// Declared failed by some member
    Failed,
}

impl NodeState {
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    /// Leaving and Failed nodes stay in the store as tombstones until the
    /// transition has been acknowledged around the ring.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, NodeState::Leaving | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Joining => "JOINING",
            NodeState::Alive => "ALIVE",
            NodeState::Leaving => "LEAVING",
            NodeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Node metrics refreshed by heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// CPU cores available
    pub cpu_cores: usize,
    /// Ring messages received
    pub messages_received: u64,
    /// Ring messages forwarded to the successor
    pub messages_forwarded: u64,
    /// Entries currently held in the history buffer
    pub history_len: usize,
    /// Topology version at sampling time
    pub topology_version: u64,
    /// Milliseconds since the node started
    pub uptime_ms: u64,
    /// Wall clock of the sample, milliseconds since the epoch
    pub updated_at_ms: u64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            cpu_cores: num_cpus::get(),
            messages_received: 0,
            messages_forwarded: 0,
            history_len: 0,
            topology_version: 0,
            uptime_ms: 0,
            updated_at_ms: unix_millis(),
        }
    }
}

/// Everything the ring knows about one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier
    pub id: NodeId,
    /// Listener address of the node
    pub address: SocketAddr,
    /// Ring position and coordinator priority, assigned at admission
    pub internal_order: u64,
    /// Latest metrics
    pub metrics: NodeMetrics,
    /// User attributes, fixed at join time
    pub attributes: BTreeMap<String, String>,
    /// Membership state
    pub state: NodeState,
    /// Crate version the node runs
    pub version: String,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            internal_order: 0,
            metrics: NodeMetrics::default(),
            attributes: BTreeMap::new(),
            state: NodeState::Joining,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
