//! Error types for the ring discovery protocol
//!
//! Ring-protocol errors are recovered inside the engine (skip, resync,
//! retry); only resource exhaustion, configuration problems and a rejected
//! or abandoned join ever reach a caller.

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::NodeId;

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Main error type for discovery operations
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Successor unreachable after the retry budget; the ring skips it
    #[error("link to {node} failed: {reason}")]
    Link { node: NodeId, reason: String },

    /// A node with this id is already a member under another address
    #[error("node id {0} is already in use")]
    DuplicateId(NodeId),

    /// A message arrived before its per-creator predecessor
    #[error("history gap from {creator}: expected seq {expected}, received {received}")]
    HistoryGap {
        creator: NodeId,
        expected: u64,
        received: u64,
    },

    /// Join did not complete within the configured timeout
    #[error("join timed out after {attempts} attempt(s)")]
    JoinTimeout { attempts: u32 },

    /// Coordinator disappeared mid-sequence
    #[error("coordinator lost")]
    CoordinatorLost,

    /// Node not present in the topology
    #[error("node {0} not found")]
    NotFound(NodeId),

    /// Topology has no alive node
    #[error("no alive node to act as coordinator")]
    NoCoordinator,

    /// Operation needs ring membership
    #[error("node has not joined the ring")]
    NotJoined,

    /// Cannot bind the listener; fatal for the node
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),

    /// Frame exceeds the configured maximum
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The node is shutting down
    #[error("node is shut down")]
    Shutdown,
}

impl DiscoveryError {
    /// Only local resource exhaustion stops a node
    pub fn is_fatal(&self) -> bool {
        matches!(self, DiscoveryError::Bind { .. })
    }

    /// Errors the ring heals from without operator intervention
    pub fn is_self_healing(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Link { .. }
                | DiscoveryError::HistoryGap { .. }
                | DiscoveryError::JoinTimeout { .. }
                | DiscoveryError::CoordinatorLost
        )
    }
}

impl From<bincode::Error> for DiscoveryError {
    fn from(err: bincode::Error) -> Self {
        DiscoveryError::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        DiscoveryError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for DiscoveryError {
    fn from(err: toml::ser::Error) -> Self {
        DiscoveryError::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, err))
    }
}
