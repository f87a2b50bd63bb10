//! Engine outputs

use bytes::Bytes;
use serde::Serialize;

use crate::cluster::JoinState;
use crate::network::TransportCommand;
use crate::types::{MessageId, NodeDescriptor, NodeId};

/// Membership and message notifications for higher layers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    NodeJoined { node: NodeDescriptor },
    NodeLeft { node_id: NodeId },
    NodeFailed { node_id: NodeId },
    CustomMessage {
        creator: NodeId,
        message_id: MessageId,
        payload: Bytes,
    },
    /// The ring declared this node failed; it stops
    Segmented,
}

impl DiscoveryEvent {
    /// Node the event is about, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            DiscoveryEvent::NodeJoined { node } => Some(node.id),
            DiscoveryEvent::NodeLeft { node_id } | DiscoveryEvent::NodeFailed { node_id } => Some(*node_id),
            DiscoveryEvent::CustomMessage { creator, .. } => Some(*creator),
            DiscoveryEvent::Segmented => None,
        }
    }
}

/// Side effects requested by the engine, executed by its owner
#[derive(Debug, Clone)]
pub enum Action {
    Transport(TransportCommand),
    Event(DiscoveryEvent),
    JoinStateChanged(JoinState),
    /// Own NodeLeft came back or the leave grace expired
    LeaveCompleted,
}
