//! # gridring
//!
//! Ring-based cluster membership and discovery.
//!
//! Nodes form a logical ring ordered by the internal order assigned at
//! admission. Every membership change and custom message travels the ring
//! once, so each node sees each creator's messages in creation order. The
//! alive node with the smallest order acts as coordinator: it admits new
//! nodes and trims the circulating history.

#![warn(clippy::all)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod message;
pub mod network;
pub mod node;
pub mod topology;
pub mod types;

pub use cluster::{JoinState, RejectReason};
pub use config::RingConfig;
pub use discovery::{DiscoveryEngine, DiscoveryEvent};
pub use error::{DiscoveryError, DiscoveryResult};
pub use node::{RingNode, TopologyView};
pub use topology::{TopologySnapshot, TopologyStore};
pub use types::{MessageId, NodeDescriptor, NodeId, NodeMetrics, NodeState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
