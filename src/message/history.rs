//! History buffer, delivery watermarks and the ensure-delivery log

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

use super::Envelope;
use crate::types::{MessageId, NodeId};

/// An accepted envelope and where it sits in local acceptance order
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub envelope: Envelope,
    pub index: u64,
    pub accepted_at: Instant,
}

/// Ordered log of accepted envelopes, bounded by count and age
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    ids: HashSet<MessageId>,
    capacity: usize,
    max_age: Duration,
    next_index: u64,
}

impl HistoryBuffer {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
            max_age,
            next_index: 0,
        }
    }

    /// Append an envelope. Returns its local index, or `None` if the id is
    /// already held.
    pub fn push(&mut self, envelope: Envelope, now: Instant) -> Option<u64> {
        if !self.ids.insert(envelope.message_id) {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.entries.push_back(HistoryEntry {
            envelope,
            index,
            accepted_at: now,
        });

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.ids.remove(&evicted.envelope.message_id);
                warn!(
                    message_id = %evicted.envelope.message_id,
                    capacity = self.capacity,
                    "History full, evicting oldest entry before discard"
                );
            }
        }
        Some(index)
    }

    /// Remove every entry up to and including `thru`. Returns the local
    /// index of `thru` when it was held.
    pub fn discard_through(&mut self, thru: MessageId) -> Option<u64> {
        if !self.ids.contains(&thru) {
            return None;
        }
        while let Some(entry) = self.entries.pop_front() {
            self.ids.remove(&entry.envelope.message_id);
            if entry.envelope.message_id == thru {
                return Some(entry.index);
            }
        }
        None
    }

    /// Drop entries older than the configured age
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.accepted_at) <= self.max_age {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                self.ids.remove(&entry.envelope.message_id);
                expired += 1;
            }
        }
        expired
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.entries.iter().map(|entry| entry.envelope.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }
}

/// Result of checking an envelope against the delivery watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Next in line for its creator
    Fresh,
    /// Already delivered
    Duplicate,
    /// One or more predecessors are missing
    Gap { expected: u64 },
}

/// Highest contiguous sequence delivered per creator
#[derive(Debug, Clone, Default)]
pub struct DeliveryTracker {
    watermarks: HashMap<NodeId, u64>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, creator: NodeId, seq: u64) -> Delivery {
        let watermark = self.watermark(creator);
        if seq <= watermark {
            Delivery::Duplicate
        } else if seq == watermark + 1 {
            Delivery::Fresh
        } else {
            Delivery::Gap {
                expected: watermark + 1,
            }
        }
    }

    pub fn record(&mut self, creator: NodeId, seq: u64) {
        let watermark = self.watermarks.entry(creator).or_insert(0);
        if seq > *watermark {
            *watermark = seq;
        }
    }

    pub fn watermark(&self, creator: NodeId) -> u64 {
        self.watermarks.get(&creator).copied().unwrap_or(0)
    }

    /// Take the higher watermark of each creator
    pub fn merge(&mut self, other: &BTreeMap<NodeId, u64>) {
        for (creator, seq) in other {
            self.record(*creator, *seq);
        }
    }

    pub fn export(&self) -> BTreeMap<NodeId, u64> {
        self.watermarks.iter().map(|(creator, seq)| (*creator, *seq)).collect()
    }

    pub fn forget(&mut self, creator: NodeId) {
        self.watermarks.remove(&creator);
    }

    pub fn clear(&mut self) {
        self.watermarks.clear();
    }
}

/// Ensure-delivery envelopes kept until a discard covers them
#[derive(Debug, Default)]
pub struct EnsureDeliveryLog {
    entries: VecDeque<EnsureDeliveryEntry>,
}

#[derive(Debug, Clone)]
pub struct EnsureDeliveryEntry {
    pub envelope: Envelope,
    pub index: u64,
    pub accepted_at: Instant,
    pub reinjected: bool,
}

impl EnsureDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, envelope: Envelope, index: u64, now: Instant) {
        self.entries.push_back(EnsureDeliveryEntry {
            envelope,
            index,
            accepted_at: now,
            reinjected: false,
        });
    }

    /// Drop entries accepted at or before the given history index
    pub fn discard_through(&mut self, index: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.index > index);
        before - self.entries.len()
    }

    /// Entries older than `timeout` that were never re-injected
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<Envelope> {
        self.entries
            .iter()
            .filter(|entry| {
                !entry.reinjected && now.saturating_duration_since(entry.accepted_at) >= timeout
            })
            .map(|entry| entry.envelope.clone())
            .collect()
    }

    pub fn mark_reinjected(&mut self, id: MessageId) {
        for entry in self.entries.iter_mut() {
            if entry.envelope.message_id == id {
                entry.reinjected = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Bounded set of recently seen ids, oldest forgotten first
#[derive(Debug)]
pub struct RecentSet {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    capacity: usize,
}

impl RecentSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// True if the id was not present
    pub fn insert(&mut self, id: MessageId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
