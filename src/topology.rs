//! Topology store
//!
//! Versioned registry of every node this member knows about. Only the
//! discovery engine mutates it; everything else reads snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::types::{MessageId, NodeDescriptor, NodeId, NodeMetrics, NodeState};

/// Serializable copy of a topology store plus the delivery watermarks of
/// the node that exported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<NodeDescriptor>,
    /// Admitted nodes waiting for `NodeAddFinished`, with the admitting node
    pub pending_finish: Vec<(NodeId, NodeId)>,
    /// Tombstoned nodes and the message that created each tombstone
    pub tombstones: Vec<(NodeId, MessageId)>,
    /// Next order the coordinator will hand out
    pub next_order: u64,
    /// Highest contiguous sequence delivered per creator
    pub watermarks: BTreeMap<NodeId, u64>,
}

impl TopologySnapshot {
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|node| node.id == id)
    }
}

/// Membership changes caused by replacing the store with a snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDiff {
    pub joined: Vec<NodeDescriptor>,
    pub left: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.failed.is_empty()
    }
}

/// Versioned membership registry
#[derive(Debug, Default)]
pub struct TopologyStore {
    nodes: HashMap<NodeId, NodeDescriptor>,
    version: u64,
    next_order: u64,
    pending_finish: HashMap<NodeId, NodeId>,
    tombstones: HashMap<NodeId, MessageId>,
    revision: u64,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a node under a locally assigned order
    pub fn admit(
        &mut self,
        descriptor: NodeDescriptor,
        order: u64,
        admitted_by: NodeId,
    ) -> DiscoveryResult<u64> {
        if self.nodes.contains_key(&descriptor.id) {
            return Err(DiscoveryError::DuplicateId(descriptor.id));
        }
        self.insert_admitted(descriptor, order, admitted_by);
        self.version += 1;
        Ok(self.version)
    }

    /// Apply an admission decided elsewhere, carrying its version.
    /// Re-applying an admission for a node already present is a no-op.
    pub fn admit_at(
        &mut self,
        descriptor: NodeDescriptor,
        order: u64,
        version: u64,
        admitted_by: NodeId,
    ) -> DiscoveryResult<u64> {
        if let Some(existing) = self.nodes.get(&descriptor.id) {
            if existing.address != descriptor.address {
                return Err(DiscoveryError::DuplicateId(descriptor.id));
            }
            return Ok(self.version);
        }
        self.insert_admitted(descriptor, order, admitted_by);
        self.version = (self.version + 1).max(version);
        Ok(self.version)
    }

    fn insert_admitted(&mut self, mut descriptor: NodeDescriptor, order: u64, admitted_by: NodeId) {
        descriptor.internal_order = order;
        descriptor.state = NodeState::Alive;
        info!(
            node = %descriptor.id.short(),
            address = %descriptor.address,
            order,
            "Node admitted to topology"
        );
        self.pending_finish.insert(descriptor.id, admitted_by);
        self.next_order = self.next_order.max(order + 1);
        self.nodes.insert(descriptor.id, descriptor);
        self.revision += 1;
    }

    /// Tombstone a node as failed. `Ok(false)` if it already was one.
    pub fn mark_failed(&mut self, id: NodeId, by: MessageId) -> DiscoveryResult<bool> {
        self.tombstone(id, NodeState::Failed, by)
    }

    /// Tombstone a node that announced its leave
    pub fn mark_left(&mut self, id: NodeId, by: MessageId) -> DiscoveryResult<bool> {
        self.tombstone(id, NodeState::Leaving, by)
    }

    fn tombstone(&mut self, id: NodeId, state: NodeState, by: MessageId) -> DiscoveryResult<bool> {
        let node = self.nodes.get_mut(&id).ok_or(DiscoveryError::NotFound(id))?;
        if node.state.is_tombstone() {
            return Ok(false);
        }
        node.state = state;
        self.pending_finish.remove(&id);
        self.tombstones.insert(id, by);
        self.version += 1;
        self.revision += 1;
        debug!(node = %id.short(), state = %state, version = self.version, "Node tombstoned");
        Ok(true)
    }

    /// Delete a node outright
    pub fn remove(&mut self, id: NodeId) -> DiscoveryResult<NodeDescriptor> {
        let node = self.nodes.remove(&id).ok_or(DiscoveryError::NotFound(id))?;
        self.pending_finish.remove(&id);
        self.tombstones.remove(&id);
        self.version += 1;
        self.revision += 1;
        Ok(node)
    }

    /// Drop tombstones whose creating message is no longer referenced
    pub fn purge_tombstones<F>(&mut self, still_referenced: F) -> Vec<NodeDescriptor>
    where
        F: Fn(&MessageId) -> bool,
    {
        let expired: Vec<NodeId> = self
            .tombstones
            .iter()
            .filter(|(_, message_id)| !still_referenced(message_id))
            .map(|(id, _)| *id)
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for id in expired {
            if let Ok(node) = self.remove(id) {
                debug!(node = %id.short(), "Tombstone purged");
                purged.push(node);
            }
        }
        purged
    }

    /// Release an admitted node into full membership. True the first time.
    pub fn finish_join(&mut self, id: NodeId) -> bool {
        let finished = self.pending_finish.remove(&id).is_some();
        if finished {
            self.revision += 1;
        }
        finished
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.pending_finish.contains_key(&id)
    }

    /// Pending joins with the node that admitted them
    pub fn pending_joins(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.pending_finish.iter().map(|(node, by)| (*node, *by))
    }

    /// Alive node with the smallest internal order
    pub fn coordinator(&self) -> DiscoveryResult<&NodeDescriptor> {
        self.nodes
            .values()
            .filter(|node| node.state.is_alive())
            .min_by_key(|node| node.internal_order)
            .ok_or(DiscoveryError::NoCoordinator)
    }

    pub fn is_coordinator(&self, id: NodeId) -> bool {
        self.coordinator().map(|node| node.id == id).unwrap_or(false)
    }

    /// Members ordered by internal order, tombstones excluded
    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<NodeDescriptor> = self
            .nodes
            .values()
            .filter(|node| !node.state.is_tombstone())
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.internal_order);
        nodes
    }

    fn ring(&self, local: NodeId, skipped: &HashSet<NodeId>) -> Option<(u64, Vec<&NodeDescriptor>)> {
        let local_order = self.nodes.get(&local)?.internal_order;
        let mut ring: Vec<&NodeDescriptor> = self
            .nodes
            .values()
            .filter(|node| node.id != local && node.state.is_alive() && !skipped.contains(&node.id))
            .collect();
        ring.sort_by_key(|node| node.internal_order);
        Some((local_order, ring))
    }

    /// Next alive node after `local` in ring order, wrapping around
    pub fn ring_successor(&self, local: NodeId, skipped: &HashSet<NodeId>) -> Option<&NodeDescriptor> {
        let (local_order, ring) = self.ring(local, skipped)?;
        ring.iter()
            .find(|node| node.internal_order > local_order)
            .or_else(|| ring.first())
            .copied()
    }

    /// Previous alive node before `local` in ring order, wrapping around
    pub fn ring_predecessor(&self, local: NodeId, skipped: &HashSet<NodeId>) -> Option<&NodeDescriptor> {
        let (local_order, ring) = self.ring(local, skipped)?;
        ring.iter()
            .rev()
            .find(|node| node.internal_order < local_order)
            .or_else(|| ring.last())
            .copied()
    }

    pub fn update_metrics(&mut self, id: NodeId, metrics: NodeMetrics) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.metrics = metrics;
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    pub fn export(&self, watermarks: BTreeMap<NodeId, u64>) -> TopologySnapshot {
        let mut nodes: Vec<NodeDescriptor> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|node| node.internal_order);
        TopologySnapshot {
            version: self.version,
            nodes,
            pending_finish: self.pending_joins().collect(),
            tombstones: self.tombstones.iter().map(|(id, by)| (*id, *by)).collect(),
            next_order: self.next_order,
            watermarks,
        }
    }

    /// Replace local state with a snapshot and report what changed
    pub fn restore(&mut self, snapshot: TopologySnapshot) -> TopologyDiff {
        let mut diff = TopologyDiff::default();
        let previous = std::mem::take(&mut self.nodes);
        let pending: HashSet<NodeId> = snapshot.pending_finish.iter().map(|(id, _)| *id).collect();

        for node in &snapshot.nodes {
            let was_member = previous
                .get(&node.id)
                .map(|old| old.state.is_alive() && !self.pending_finish.contains_key(&old.id))
                .unwrap_or(false);
            match node.state {
                NodeState::Alive if !was_member && !pending.contains(&node.id) => {
                    diff.joined.push(node.clone())
                }
                NodeState::Leaving if previous.get(&node.id).map_or(false, |old| !old.state.is_tombstone()) => {
                    diff.left.push(node.id)
                }
                NodeState::Failed if previous.get(&node.id).map_or(false, |old| !old.state.is_tombstone()) => {
                    diff.failed.push(node.id)
                }
                _ => {}
            }
        }
        for (id, old) in &previous {
            if !old.state.is_tombstone() && !snapshot.contains(*id) {
                diff.failed.push(*id);
            }
        }

        self.nodes = snapshot.nodes.into_iter().map(|node| (node.id, node)).collect();
        self.pending_finish = snapshot.pending_finish.into_iter().collect();
        self.tombstones = snapshot.tombstones.into_iter().collect();
        self.version = self.version.max(snapshot.version);
        self.next_order = self.next_order.max(snapshot.next_order);
        self.revision += 1;
        diff
    }

    /// Forget everything; used when a join attempt starts over
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.pending_finish.clear();
        self.tombstones.clear();
        self.revision += 1;
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map_or(false, |node| node.state.is_alive())
    }

    pub fn alive_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|node| node.state.is_alive())
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bumps on any change, metrics included
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn next_order(&self) -> u64 {
        self.next_order
    }
}
