//! Ring messages
//!
//! Every protocol event travels the ring wrapped in an [`Envelope`]. The
//! payload is a tagged union; the envelope adds identity, the
//! ensure-delivery flag and the two hop markers.

pub mod codec;
pub mod history;

pub use codec::*;
pub use history::*;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::topology::TopologySnapshot;
use crate::types::{MessageId, NodeDescriptor, NodeId, NodeMetrics};

/// Protocol message variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Candidate asking to be admitted, relayed toward the coordinator
    JoinRequest {
        candidate: NodeDescriptor,
        responded: bool,
    },
    /// Admission decided by the coordinator
    NodeAdded {
        candidate: NodeDescriptor,
        assigned_order: u64,
        topology_version: u64,
        snapshot: Box<TopologySnapshot>,
    },
    /// NodeAdded has been around the ring; the candidate is a full member
    NodeAddFinished { node_id: NodeId },
    /// Graceful leave
    NodeLeft { node_id: NodeId },
    /// Failure verdict of some member's detector
    NodeFailed { node_id: NodeId, reason: String },
    /// Prune history up to and including this message
    Discard { thru_message_id: MessageId },
    Heartbeat { node_id: NodeId, metrics: NodeMetrics },
    /// Opaque bytes injected by a higher layer
    Custom { user_payload: Bytes },
}

impl Payload {
    /// Type tag used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::JoinRequest { .. } => "JoinRequest",
            Payload::NodeAdded { .. } => "NodeAdded",
            Payload::NodeAddFinished { .. } => "NodeAddFinished",
            Payload::NodeLeft { .. } => "NodeLeft",
            Payload::NodeFailed { .. } => "NodeFailed",
            Payload::Discard { .. } => "Discard",
            Payload::Heartbeat { .. } => "Heartbeat",
            Payload::Custom { .. } => "Custom",
        }
    }

    /// Node whose membership this payload changes, if any
    pub fn subject(&self) -> Option<NodeId> {
        match self {
            Payload::JoinRequest { candidate, .. } | Payload::NodeAdded { candidate, .. } => {
                Some(candidate.id)
            }
            Payload::NodeAddFinished { node_id }
            | Payload::NodeLeft { node_id }
            | Payload::NodeFailed { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }
}

/// Wire wrapper around a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub creator: NodeId,
    pub payload: Payload,
    /// Survives coordinator failover through re-injection
    pub ensure_delivery: bool,
    /// A ring member vetted this join request
    pub verified: bool,
    /// Re-injected from history by this node; circulation ends there
    pub pending: Option<NodeId>,
}

impl Envelope {
    pub fn new(message_id: MessageId, creator: NodeId, payload: Payload) -> Self {
        Self {
            message_id,
            creator,
            payload,
            ensure_delivery: false,
            verified: false,
            pending: None,
        }
    }

    pub fn with_ensure_delivery(mut self, ensure_delivery: bool) -> Self {
        self.ensure_delivery = ensure_delivery;
        self
    }

    /// Ring messages take part in per-creator sequencing
    pub fn is_ring(&self) -> bool {
        !self.message_id.is_direct()
    }

    pub fn seq(&self) -> u64 {
        self.message_id.seq()
    }
}

/// Hands out message ids for one creator
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    creator: NodeId,
    ring_seq: u64,
    direct_seq: u64,
}

impl MessageIdGenerator {
    pub fn new(creator: NodeId) -> Self {
        Self {
            creator,
            ring_seq: 0,
            direct_seq: 0,
        }
    }

    /// Next id in the dense ring sequence
    pub fn next_ring(&mut self) -> MessageId {
        self.ring_seq += 1;
        MessageId::new(self.creator, self.ring_seq)
    }

    /// Next id for a point-to-point message
    pub fn next_direct(&mut self) -> MessageId {
        self.direct_seq += 1;
        MessageId::direct(self.creator, self.direct_seq)
    }

    pub fn last_ring(&self) -> u64 {
        self.ring_seq
    }

    /// Continue after sequences other members already hold for us
    pub fn advance_to(&mut self, seq: u64) {
        self.ring_seq = self.ring_seq.max(seq);
    }

    pub fn creator(&self) -> NodeId {
        self.creator
    }
}
