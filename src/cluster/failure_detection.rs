//! Failure detection for ring members
//!
//! Heartbeats circulate the ring, so every member watches every other
//! member. Silence first makes a node a suspect and earns it a direct
//! probe; only a failed probe or an expired grace period makes it FAILED.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::FailureDetectionConfig;
use crate::types::NodeId;

/// Local liveness opinion about one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Suspect,
    /// Terminal
    Failed,
}

/// Work the detector asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Node became a suspect; probe it directly
    Probe(NodeId),
    /// Node is considered crashed
    Failed(NodeId),
}

/// Pluggable failure detection strategy
pub trait FailureDetector: Send {
    /// Start watching a node
    fn track(&mut self, node: NodeId, now: Instant);

    fn untrack(&mut self, node: NodeId);

    /// Record a heartbeat; a suspect recovers silently
    fn heartbeat(&mut self, node: NodeId, now: Instant);

    /// Force suspicion, e.g. after the link to the node failed
    fn suspect(&mut self, node: NodeId, now: Instant) -> Option<Verdict>;

    /// Outcome of a direct probe
    fn probe_result(&mut self, node: NodeId, alive: bool, now: Instant) -> Option<Verdict>;

    /// Advance timers
    fn check(&mut self, now: Instant) -> Vec<Verdict>;

    fn state(&self, node: NodeId) -> Option<LivenessState>;

    fn clear(&mut self);
}

#[derive(Debug, Clone)]
struct Liveness {
    state: LivenessState,
    last_heartbeat: Instant,
    suspected_at: Option<Instant>,
}

/// Heartbeat-count detector with probe confirmation
#[derive(Debug)]
pub struct HeartbeatFailureDetector {
    suspect_after: Duration,
    probe_grace: Duration,
    nodes: HashMap<NodeId, Liveness>,
}

impl HeartbeatFailureDetector {
    pub fn new(config: &FailureDetectionConfig) -> Self {
        Self {
            suspect_after: config.suspect_after(),
            probe_grace: config.probe_grace,
            nodes: HashMap::new(),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.nodes.len()
    }

    fn make_suspect(entry: &mut Liveness, node: NodeId, now: Instant) -> Option<Verdict> {
        if entry.state != LivenessState::Alive {
            return None;
        }
        entry.state = LivenessState::Suspect;
        entry.suspected_at = Some(now);
        debug!(node = %node.short(), "Node suspected, probing");
        Some(Verdict::Probe(node))
    }
}

impl FailureDetector for HeartbeatFailureDetector {
    fn track(&mut self, node: NodeId, now: Instant) {
        self.nodes.entry(node).or_insert(Liveness {
            state: LivenessState::Alive,
            last_heartbeat: now,
            suspected_at: None,
        });
    }

    fn untrack(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    fn heartbeat(&mut self, node: NodeId, now: Instant) {
        let entry = self.nodes.entry(node).or_insert(Liveness {
            state: LivenessState::Alive,
            last_heartbeat: now,
            suspected_at: None,
        });
        if entry.state == LivenessState::Failed {
            return;
        }
        entry.last_heartbeat = now;
        entry.state = LivenessState::Alive;
        entry.suspected_at = None;
    }

    fn suspect(&mut self, node: NodeId, now: Instant) -> Option<Verdict> {
        let entry = self.nodes.entry(node).or_insert(Liveness {
            state: LivenessState::Alive,
            last_heartbeat: now,
            suspected_at: None,
        });
        Self::make_suspect(entry, node, now)
    }

    fn probe_result(&mut self, node: NodeId, alive: bool, now: Instant) -> Option<Verdict> {
        let entry = self.nodes.get_mut(&node)?;
        if entry.state != LivenessState::Suspect {
            return None;
        }
        if alive {
            entry.state = LivenessState::Alive;
            entry.last_heartbeat = now;
            entry.suspected_at = None;
            None
        } else {
            entry.state = LivenessState::Failed;
            warn!(node = %node.short(), "Probe failed, node declared failed");
            Some(Verdict::Failed(node))
        }
    }

    fn check(&mut self, now: Instant) -> Vec<Verdict> {
        let mut verdicts = Vec::new();
        for (node, entry) in self.nodes.iter_mut() {
            match entry.state {
                LivenessState::Alive => {
                    if now.saturating_duration_since(entry.last_heartbeat) >= self.suspect_after {
                        if let Some(verdict) = Self::make_suspect(entry, *node, now) {
                            verdicts.push(verdict);
                        }
                    }
                }
                LivenessState::Suspect => {
                    let since = entry.suspected_at.unwrap_or(now);
                    if now.saturating_duration_since(since) >= self.probe_grace {
                        entry.state = LivenessState::Failed;
                        warn!(node = %node.short(), "Suspect exceeded probe grace, node declared failed");
                        verdicts.push(Verdict::Failed(*node));
                    }
                }
                LivenessState::Failed => {}
            }
        }
        verdicts
    }

    fn state(&self, node: NodeId) -> Option<LivenessState> {
        self.nodes.get(&node).map(|entry| entry.state)
    }

    fn clear(&mut self) {
        self.nodes.clear();
    }
}
