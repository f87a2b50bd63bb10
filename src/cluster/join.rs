//! Join admission
//!
//! The coordinator serializes admissions through a [`JoinSequencer`]. The
//! candidate side of a join is tracked by [`JoinState`] and
//! [`JoinProgress`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::message::RecentSet;
use crate::topology::TopologyStore;
use crate::types::{MessageId, NodeDescriptor};

/// Why a candidate cannot join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The id belongs to a member at another address
    DuplicateId,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DuplicateId => f.write_str("node id already in use"),
        }
    }
}

/// Why a join request was dropped without an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// This request id was already admitted here
    AlreadyAnswered,
    /// Another coordinator already answered it
    Responded,
    /// The id is still a tombstone from an earlier incarnation
    Tombstoned,
}

/// Coordinator decision on a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Admit { order: u64 },
    /// Same id and address are already members; answer again without a
    /// new admission
    Readmit { order: u64 },
    Ignore(IgnoreReason),
    Reject(RejectReason),
}

/// Admission policy used by the coordinator
pub trait JoinSequencer: Send {
    fn review(
        &mut self,
        topology: &TopologyStore,
        request_id: MessageId,
        candidate: &NodeDescriptor,
        responded: bool,
    ) -> JoinDecision;

    /// Forget answered requests, e.g. after the local state was reset
    fn reset(&mut self);
}

/// Default sequencer: orders follow the topology high-water mark
#[derive(Debug)]
pub struct CoordinatorJoinSequencer {
    answered: RecentSet,
}

impl CoordinatorJoinSequencer {
    pub fn new() -> Self {
        Self {
            answered: RecentSet::new(1024),
        }
    }
}

impl Default for CoordinatorJoinSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinSequencer for CoordinatorJoinSequencer {
    fn review(
        &mut self,
        topology: &TopologyStore,
        request_id: MessageId,
        candidate: &NodeDescriptor,
        responded: bool,
    ) -> JoinDecision {
        if self.answered.contains(&request_id) {
            return JoinDecision::Ignore(IgnoreReason::AlreadyAnswered);
        }
        if responded {
            return JoinDecision::Ignore(IgnoreReason::Responded);
        }

        match topology.get(candidate.id) {
            Some(existing) if existing.state.is_tombstone() => {
                JoinDecision::Ignore(IgnoreReason::Tombstoned)
            }
            Some(existing) if existing.address == candidate.address => {
                self.answered.insert(request_id);
                JoinDecision::Readmit {
                    order: existing.internal_order,
                }
            }
            Some(_) => JoinDecision::Reject(RejectReason::DuplicateId),
            None => {
                self.answered.insert(request_id);
                JoinDecision::Admit {
                    order: topology.next_order(),
                }
            }
        }
    }

    fn reset(&mut self) {
        self.answered.clear();
    }
}

/// Lifecycle of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinState {
    Disconnected,
    /// Contacting a seed
    Connecting,
    /// Join request travelling toward the coordinator
    Forwarding,
    /// Admitted, waiting for NodeAddFinished
    Pending,
    Alive,
    Leaving,
    Left,
    Rejected(RejectReason),
    GaveUp { attempts: u32 },
    /// Declared failed by the rest of the ring
    Segmented,
}

impl JoinState {
    /// Holds a position in the ring
    pub fn is_member(&self) -> bool {
        matches!(self, JoinState::Pending | JoinState::Alive | JoinState::Leaving)
    }

    pub fn is_joining(&self) -> bool {
        matches!(self, JoinState::Connecting | JoinState::Forwarding)
    }

    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JoinState::Left | JoinState::Rejected(_) | JoinState::GaveUp { .. } | JoinState::Segmented
        )
    }
}

impl std::fmt::Display for JoinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinState::Disconnected => f.write_str("DISCONNECTED"),
            JoinState::Connecting => f.write_str("CONNECTING"),
            JoinState::Forwarding => f.write_str("FORWARDING"),
            JoinState::Pending => f.write_str("PENDING"),
            JoinState::Alive => f.write_str("ALIVE"),
            JoinState::Leaving => f.write_str("LEAVING"),
            JoinState::Left => f.write_str("LEFT"),
            JoinState::Rejected(reason) => write!(f, "REJECTED ({})", reason),
            JoinState::GaveUp { attempts } => write!(f, "GAVE UP after {} attempt(s)", attempts),
            JoinState::Segmented => f.write_str("SEGMENTED"),
        }
    }
}

/// Candidate-side bookkeeping for one join
#[derive(Debug, Clone)]
pub struct JoinProgress {
    seeds: Vec<SocketAddr>,
    untried: Vec<SocketAddr>,
    unreachable: HashSet<SocketAddr>,
    contact: Option<SocketAddr>,
    attempts: u32,
    started_at: Option<Instant>,
}

impl JoinProgress {
    /// Seeds equal to the local address are ignored
    pub fn new(seeds: Vec<SocketAddr>, local: SocketAddr) -> Self {
        let mut unique = Vec::new();
        for seed in seeds {
            if seed != local && !unique.contains(&seed) {
                unique.push(seed);
            }
        }
        Self {
            seeds: unique,
            untried: Vec::new(),
            unreachable: HashSet::new(),
            contact: None,
            attempts: 0,
            started_at: None,
        }
    }

    pub fn has_seeds(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Start a new attempt, preferring seeds other than the last contact
    pub fn begin_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.started_at = Some(now);
        self.unreachable.clear();
        self.untried = self
            .seeds
            .iter()
            .copied()
            .filter(|seed| Some(*seed) != self.contact || self.seeds.len() == 1)
            .collect();
    }

    /// Pick a random untried seed
    pub fn next_contact(&mut self) -> Option<SocketAddr> {
        if self.untried.is_empty() {
            self.untried = self
                .seeds
                .iter()
                .copied()
                .filter(|seed| !self.unreachable.contains(seed))
                .collect();
        }
        if self.untried.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.untried.len());
        let contact = self.untried.swap_remove(index);
        self.contact = Some(contact);
        Some(contact)
    }

    /// Returns true once every seed failed in the current attempt
    pub fn mark_unreachable(&mut self, address: SocketAddr) -> bool {
        self.unreachable.insert(address);
        self.untried.retain(|seed| *seed != address);
        self.seeds.iter().all(|seed| self.unreachable.contains(seed))
    }

    pub fn contact(&self) -> Option<SocketAddr> {
        self.contact
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }
}
