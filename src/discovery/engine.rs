//! Discovery engine
//!
//! The synchronous heart of a ring node. It owns the topology store, the
//! history buffer and the join state, consumes transport events, timer ticks
//! and API calls, and answers with [`Action`]s. It never performs I/O and
//! never reads the clock itself, so the same code runs inside the async node
//! and inside deterministic tests.
//!
//! Receive path for a ring envelope:
//!
//! 1. classify against the per-creator watermark (fresh, duplicate, gap)
//! 2. fresh: apply, record in history, forward to the successor
//! 3. duplicate: dropped, unless it is our own message finishing its
//!    revolution or a re-injected message still travelling
//! 4. gap: parked until a snapshot from the predecessor arrives

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::events::{Action, DiscoveryEvent};
use crate::cluster::{
    CoordinatorJoinSequencer, FailureDetector, HeartbeatFailureDetector, JoinDecision,
    JoinProgress, JoinSequencer, JoinState, RejectReason, Verdict,
};
use crate::config::{DiscoveryConfig, RingConfig};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::message::{
    Delivery, DeliveryTracker, EnsureDeliveryLog, Envelope, Frame, HistoryBuffer,
    MessageIdGenerator, Payload, RecentSet,
};
use crate::network::{TransportCommand, TransportEvent};
use crate::topology::{TopologyDiff, TopologySnapshot, TopologyStore};
use crate::types::{unix_millis, MessageId, NodeDescriptor, NodeId, NodeMetrics, NodeState};

const RECENT_CAPACITY: usize = 4096;

/// Single-threaded protocol state machine of one ring node
pub struct DiscoveryEngine {
    local: NodeDescriptor,
    config: DiscoveryConfig,
    heartbeat_interval: Duration,
    allow_bootstrap: bool,

    topology: TopologyStore,
    history: HistoryBuffer,
    delivery: DeliveryTracker,
    ensure_log: EnsureDeliveryLog,
    ids: MessageIdGenerator,
    detector: Box<dyn FailureDetector>,
    sequencer: Box<dyn JoinSequencer>,

    join_state: JoinState,
    progress: JoinProgress,
    successor: Option<NodeDescriptor>,
    /// Nodes whose link failed; routed around until they heartbeat again
    skipped: HashSet<NodeId>,
    was_coordinator: bool,

    relayed_joins: RecentSet,
    reinjected_seen: RecentSet,
    failed_reported: HashSet<NodeId>,
    finish_resumed: HashSet<NodeId>,

    /// Last own ring message that completed a revolution
    own_completed: Option<MessageId>,
    last_discard_emitted: Option<MessageId>,
    last_discard_at: Instant,
    since_discard: usize,
    last_heartbeat_at: Option<Instant>,

    resync_requested_at: Option<Instant>,
    parked: VecDeque<Envelope>,
    leave_started_at: Option<Instant>,

    started_at: Instant,
    messages_received: u64,
    messages_forwarded: u64,
    actions: Vec<Action>,
}

impl DiscoveryEngine {
    pub fn new(
        local: NodeDescriptor,
        config: &RingConfig,
        detector: Box<dyn FailureDetector>,
        sequencer: Box<dyn JoinSequencer>,
        now: Instant,
    ) -> Self {
        let discovery = config.discovery.clone();
        let progress = JoinProgress::new(config.node.seeds.clone(), local.address);
        Self {
            ids: MessageIdGenerator::new(local.id),
            history: HistoryBuffer::new(discovery.history_capacity, discovery.history_max_age),
            heartbeat_interval: config.failure_detection.heartbeat_interval,
            allow_bootstrap: config.node.allow_bootstrap,
            topology: TopologyStore::new(),
            delivery: DeliveryTracker::new(),
            ensure_log: EnsureDeliveryLog::new(),
            detector,
            sequencer,
            join_state: JoinState::Disconnected,
            progress,
            successor: None,
            skipped: HashSet::new(),
            was_coordinator: false,
            relayed_joins: RecentSet::new(RECENT_CAPACITY),
            reinjected_seen: RecentSet::new(RECENT_CAPACITY),
            failed_reported: HashSet::new(),
            finish_resumed: HashSet::new(),
            own_completed: None,
            last_discard_emitted: None,
            last_discard_at: now,
            since_discard: 0,
            last_heartbeat_at: None,
            resync_requested_at: None,
            parked: VecDeque::new(),
            leave_started_at: None,
            started_at: now,
            messages_received: 0,
            messages_forwarded: 0,
            actions: Vec::new(),
            config: discovery,
            local,
        }
    }

    /// Engine with the heartbeat detector and the coordinator sequencer
    pub fn with_defaults(local: NodeDescriptor, config: &RingConfig, now: Instant) -> Self {
        let detector = Box::new(HeartbeatFailureDetector::new(&config.failure_detection));
        let sequencer = Box::new(CoordinatorJoinSequencer::new());
        Self::new(local, config, detector, sequencer, now)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Join through the configured seeds, or start a new ring without any
    pub fn start(&mut self, now: Instant) {
        if self.join_state != JoinState::Disconnected {
            return;
        }
        if self.progress.has_seeds() {
            self.begin_join_attempt(now);
        } else {
            self.bootstrap(now);
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if self.join_state.is_terminal() {
            return;
        }
        match event {
            TransportEvent::Frame { from, frame } => self.on_frame(from, frame, now),
            TransportEvent::LinkFailed { node, reason } => self.on_link_failed(node, &reason, now),
            TransportEvent::DirectDelivered { address } => {
                if self.join_state == JoinState::Connecting && self.progress.contact() == Some(address) {
                    self.set_state(JoinState::Forwarding);
                }
            }
            TransportEvent::DirectFailed { address, reason } => {
                if self.join_state.is_joining() && self.progress.contact() == Some(address) {
                    warn!(contact = %address, reason = %reason, "Seed unreachable");
                    if self.progress.mark_unreachable(address) {
                        self.on_seeds_exhausted(now);
                    } else {
                        self.try_next_contact(now);
                    }
                }
            }
            TransportEvent::ProbeResult { node, alive } => {
                if let Some(verdict) = self.detector.probe_result(node, alive, now) {
                    self.handle_verdict(verdict, now);
                }
            }
        }
    }

    /// Drive timers: join and leave timeouts, heartbeats, failure checks,
    /// resync timeout, history ageing, and the coordinator duties
    pub fn tick(&mut self, now: Instant) {
        if self.join_state.is_terminal() {
            return;
        }

        match self.join_state {
            JoinState::Connecting | JoinState::Forwarding | JoinState::Pending => {
                let started = self.progress.started_at().unwrap_or(now);
                if now.saturating_duration_since(started) >= self.config.join_timeout {
                    self.on_join_timeout(now);
                    return;
                }
            }
            JoinState::Leaving => {
                let started = self.leave_started_at.unwrap_or(now);
                if now.saturating_duration_since(started) >= self.config.leave_grace {
                    warn!(node = %self.local.id.short(), "Leave not acknowledged within grace period");
                    self.complete_leave();
                    return;
                }
            }
            _ => {}
        }

        if !matches!(self.join_state, JoinState::Pending | JoinState::Alive) {
            return;
        }

        let heartbeat_due = self
            .last_heartbeat_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.heartbeat_interval);
        if heartbeat_due {
            self.last_heartbeat_at = Some(now);
            let metrics = self.metrics(now);
            self.originate(
                Payload::Heartbeat {
                    node_id: self.local.id,
                    metrics,
                },
                false,
                now,
            );
        }

        for verdict in self.detector.check(now) {
            self.handle_verdict(verdict, now);
        }

        if let Some(requested_at) = self.resync_requested_at {
            if now.saturating_duration_since(requested_at) >= self.config.resync_timeout {
                warn!(parked = self.parked.len(), "No snapshot within resync timeout, accepting parked messages");
                self.resync_requested_at = None;
                self.replay_parked(now, true);
            }
        }

        let expired = self.history.expire(now);
        if expired > 0 {
            debug!(expired, "History entries aged out");
        }

        if self.topology.is_coordinator(self.local.id) {
            self.maybe_discard(now);
            self.resume_incomplete(now);
        }
    }

    /// Inject a custom message; it reaches every member in creation order
    pub fn broadcast(&mut self, payload: Bytes, ensure_delivery: bool, now: Instant) -> DiscoveryResult<MessageId> {
        if !matches!(self.join_state, JoinState::Pending | JoinState::Alive) {
            return Err(DiscoveryError::NotJoined);
        }
        Ok(self.originate(Payload::Custom { user_payload: payload }, ensure_delivery, now))
    }

    /// Announce a graceful leave
    pub fn leave(&mut self, now: Instant) -> DiscoveryResult<()> {
        match self.join_state {
            JoinState::Pending | JoinState::Alive => {}
            JoinState::Leaving => return Ok(()),
            _ => return Err(DiscoveryError::NotJoined),
        }
        info!(node = %self.local.id.short(), "Leaving ring");
        self.set_state(JoinState::Leaving);
        self.leave_started_at = Some(now);
        self.originate(Payload::NodeLeft { node_id: self.local.id }, false, now);
        Ok(())
    }

    /// Take the actions produced since the last call
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn join_state(&self) -> JoinState {
        self.join_state
    }

    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        self.topology.snapshot()
    }

    pub fn coordinator(&self) -> Option<NodeDescriptor> {
        self.topology.coordinator().ok().cloned()
    }

    pub fn is_coordinator(&self) -> bool {
        self.topology.is_coordinator(self.local.id)
    }

    pub fn successor(&self) -> Option<&NodeDescriptor> {
        self.successor.as_ref()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_contains(&self, id: &MessageId) -> bool {
        self.history.contains(id)
    }

    pub fn watermark(&self, creator: NodeId) -> u64 {
        self.delivery.watermark(creator)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn ensure_log_len(&self) -> usize {
        self.ensure_log.len()
    }

    // ------------------------------------------------------------------
    // Join, candidate side
    // ------------------------------------------------------------------

    fn bootstrap(&mut self, now: Instant) {
        self.reset_local_state();
        let order = self.topology.next_order();
        let mut descriptor = self.local.clone();
        descriptor.metrics = self.metrics(now);
        match self.topology.admit(descriptor, order, self.local.id) {
            Ok(version) => {
                self.topology.finish_join(self.local.id);
                self.local.internal_order = order;
                self.local.state = NodeState::Alive;
                info!(node = %self.local.id.short(), version, "Started new ring as coordinator");
                self.set_state(JoinState::Alive);
                self.refresh_ring(now);
            }
            Err(e) => error!(error = %e, "Bootstrap failed"),
        }
    }

    fn begin_join_attempt(&mut self, now: Instant) {
        if let Some(max) = self.config.max_join_attempts {
            if self.progress.attempts() >= max {
                error!(attempts = self.progress.attempts(), "Giving up on joining the ring");
                self.set_state(JoinState::GaveUp {
                    attempts: self.progress.attempts(),
                });
                return;
            }
        }
        self.progress.begin_attempt(now);
        debug!(attempt = self.progress.attempts(), "Starting join attempt");
        self.try_next_contact(now);
    }

    fn try_next_contact(&mut self, now: Instant) {
        match self.progress.next_contact() {
            Some(contact) => {
                self.set_state(JoinState::Connecting);
                let request_id = self.ids.next_direct();
                let request = Envelope::new(
                    request_id,
                    self.local.id,
                    Payload::JoinRequest {
                        candidate: self.local.clone(),
                        responded: false,
                    },
                );
                info!(contact = %contact, request = %request_id, "Sending join request");
                self.push_transport(TransportCommand::Direct {
                    address: contact,
                    frame: Frame::Envelope(request),
                    report: true,
                });
            }
            None => self.on_seeds_exhausted(now),
        }
    }

    fn on_seeds_exhausted(&mut self, now: Instant) {
        if self.allow_bootstrap {
            warn!("No seed reachable, bootstrapping a new ring");
            self.bootstrap(now);
        } else {
            warn!("No seed reachable, waiting for join timeout");
        }
    }

    fn on_join_timeout(&mut self, now: Instant) {
        warn!(
            state = %self.join_state,
            attempt = self.progress.attempts(),
            "Join timed out, restarting with another contact"
        );
        if self.join_state == JoinState::Pending {
            self.reset_local_state();
        }
        self.begin_join_attempt(now);
    }

    /// The joiner received its own NodeAdded
    fn on_own_admission(&mut self, envelope: Envelope, now: Instant) {
        let (assigned_order, snapshot) = match &envelope.payload {
            Payload::NodeAdded {
                assigned_order,
                snapshot,
                ..
            } => (*assigned_order, (**snapshot).clone()),
            _ => return,
        };
        info!(
            node = %self.local.id.short(),
            order = assigned_order,
            version = snapshot.version,
            coordinator = %envelope.creator.short(),
            "Admitted to ring"
        );

        self.topology.clear();
        self.delivery.merge(&snapshot.watermarks);
        self.ids.advance_to(snapshot.watermarks.get(&self.local.id).copied().unwrap_or(0));
        let diff = self.topology.restore(snapshot);
        self.local.internal_order = assigned_order;
        self.local.state = NodeState::Alive;
        self.emit_diff(diff);
        let peers: Vec<NodeId> = self
            .topology
            .alive_nodes()
            .map(|node| node.id)
            .filter(|id| *id != self.local.id)
            .collect();
        for peer in peers {
            self.detector.track(peer, now);
        }

        self.set_state(JoinState::Pending);
        self.record(&envelope, now);
        self.refresh_ring(now);
        if !self.replay_parked(now, false) {
            self.request_resync(now);
        }
    }

    fn reset_local_state(&mut self) {
        self.topology.clear();
        self.history.clear();
        self.delivery.clear();
        self.ensure_log.clear();
        self.parked.clear();
        self.resync_requested_at = None;
        self.skipped.clear();
        self.detector.clear();
        self.sequencer.reset();
        self.relayed_joins.clear();
        self.reinjected_seen.clear();
        self.failed_reported.clear();
        self.finish_resumed.clear();
        self.own_completed = None;
        self.last_discard_emitted = None;
        self.was_coordinator = false;
        self.local.state = NodeState::Joining;
        if self.successor.take().is_some() {
            self.push_transport(TransportCommand::SetSuccessor(None));
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    fn on_frame(&mut self, from: NodeId, frame: Frame, now: Instant) {
        match frame {
            Frame::Envelope(envelope) if envelope.message_id.is_direct() => {
                self.on_join_request(envelope, now)
            }
            Frame::Envelope(envelope) => self.on_ring_envelope(envelope, now),
            Frame::SnapshotRequest { requester, address } => {
                if self.join_state.is_member() {
                    debug!(requester = %requester.short(), "Answering snapshot request");
                    let snapshot = self.topology.export(self.delivery.export());
                    self.push_transport(TransportCommand::Direct {
                        address,
                        frame: Frame::Snapshot {
                            from: self.local.id,
                            snapshot,
                        },
                        report: false,
                    });
                }
            }
            Frame::Snapshot { from, snapshot } => self.on_snapshot(from, snapshot, now),
            Frame::JoinRejected { candidate, reason } => {
                if candidate == self.local.id && self.join_state.is_joining() {
                    error!(reason = %reason, "Join rejected");
                    self.set_state(JoinState::Rejected(reason));
                }
            }
            Frame::Handshake { .. } | Frame::Probe { .. } | Frame::ProbeAck { .. } => {
                trace!(from = %from.short(), "Transport-level frame reached the engine");
            }
        }
    }

    fn on_ring_envelope(&mut self, envelope: Envelope, now: Instant) {
        if !self.join_state.is_member() {
            let own_admission = matches!(
                &envelope.payload,
                Payload::NodeAdded { candidate, .. } if candidate.id == self.local.id
            );
            if own_admission && self.join_state.is_joining() {
                self.on_own_admission(envelope, now);
            } else if self.join_state.is_joining() {
                self.park(envelope);
            }
            return;
        }

        if self.resync_requested_at.is_some() {
            self.park(envelope);
            return;
        }

        // A purged creator has no watermark left; its re-injected messages
        // were delivered long ago
        if envelope.pending.is_some() && !self.topology.contains(envelope.creator) {
            self.on_duplicate(envelope, now);
            return;
        }

        match self.delivery.classify(envelope.creator, envelope.seq()) {
            Delivery::Fresh => self.accept(envelope, now),
            Delivery::Duplicate => self.on_duplicate(envelope, now),
            Delivery::Gap { expected } => {
                let gap = DiscoveryError::HistoryGap {
                    creator: envelope.creator,
                    expected,
                    received: envelope.seq(),
                };
                warn!(error = %gap, "Parking message and requesting snapshot");
                self.park(envelope);
                self.request_resync(now);
            }
        }
    }

    /// Apply, record and pass on a fresh envelope
    fn accept(&mut self, envelope: Envelope, now: Instant) {
        let own = envelope.creator == self.local.id;
        if !own {
            self.messages_received += 1;
        }
        trace!(
            message_id = %envelope.message_id,
            creator = %envelope.creator.short(),
            kind = envelope.payload.kind(),
            "Accepting message"
        );

        self.apply(&envelope, now);
        self.record(&envelope, now);
        self.since_discard += 1;

        // A leaving successor must see its NodeLeft before we route around it
        if let Payload::NodeLeft { node_id } = &envelope.payload {
            if *node_id != self.local.id && self.successor_id() == Some(*node_id) {
                self.forward(&envelope);
            }
        }

        if self.join_state.is_terminal() {
            return;
        }
        if !self.refresh_ring(now) {
            self.forward(&envelope);
        }
        if own && self.successor.is_none() {
            // One-member ring: the message is back home immediately
            self.on_own_return(&envelope, now);
        }
    }

    fn on_duplicate(&mut self, envelope: Envelope, now: Instant) {
        if envelope.creator == self.local.id {
            self.on_own_return(&envelope, now);
            return;
        }
        if let Some(reinjector) = envelope.pending {
            if reinjector == self.local.id {
                trace!(message_id = %envelope.message_id, "Re-injected message back at origin");
                return;
            }
            if self.topology.is_alive(reinjector) && self.reinjected_seen.insert(envelope.message_id) {
                self.forward(&envelope);
            }
            return;
        }
        trace!(message_id = %envelope.message_id, "Duplicate dropped");
    }

    /// An own message completed its revolution
    fn on_own_return(&mut self, envelope: &Envelope, now: Instant) {
        if let Some(done) = self.own_completed {
            if envelope.seq() <= done.seq() {
                return;
            }
        }
        self.own_completed = Some(envelope.message_id);
        trace!(message_id = %envelope.message_id, "Own message completed revolution");

        match &envelope.payload {
            Payload::NodeAdded { candidate, .. } => {
                if self.topology.is_alive(candidate.id) {
                    info!(node = %candidate.id.short(), "NodeAdded circulated, finishing join");
                    self.originate(
                        Payload::NodeAddFinished {
                            node_id: candidate.id,
                        },
                        true,
                        now,
                    );
                }
            }
            Payload::NodeLeft { node_id } if *node_id == self.local.id => {
                if self.join_state == JoinState::Leaving {
                    info!(node = %self.local.id.short(), "Leave acknowledged by the ring");
                    self.complete_leave();
                }
            }
            _ => {}
        }
    }

    /// Create an own ring message and run it through the receive path
    fn originate(&mut self, payload: Payload, ensure_delivery: bool, now: Instant) -> MessageId {
        let id = self.ids.next_ring();
        let envelope = Envelope::new(id, self.local.id, payload).with_ensure_delivery(ensure_delivery);
        self.accept(envelope, now);
        id
    }

    fn record(&mut self, envelope: &Envelope, now: Instant) {
        self.delivery.record(envelope.creator, envelope.seq());
        if let Some(index) = self.history.push(envelope.clone(), now) {
            if envelope.ensure_delivery {
                self.ensure_log.insert(envelope.clone(), index, now);
            }
        }
    }

    fn forward(&mut self, envelope: &Envelope) {
        if self.successor.is_some() {
            self.messages_forwarded += 1;
            self.push_transport(TransportCommand::Forward(envelope.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Applying payloads
    // ------------------------------------------------------------------

    fn apply(&mut self, envelope: &Envelope, now: Instant) {
        match &envelope.payload {
            Payload::JoinRequest { .. } => {}
            Payload::NodeAdded {
                candidate,
                assigned_order,
                topology_version,
                ..
            } => {
                if candidate.id == self.local.id {
                    return;
                }
                match self
                    .topology
                    .admit_at(candidate.clone(), *assigned_order, *topology_version, envelope.creator)
                {
                    Ok(version) => {
                        self.detector.track(candidate.id, now);
                        debug!(node = %candidate.id.short(), version, "Applied NodeAdded");
                    }
                    Err(e) => warn!(error = %e, "Cannot apply NodeAdded"),
                }
            }
            Payload::NodeAddFinished { node_id } => {
                if self.topology.finish_join(*node_id) && *node_id != self.local.id {
                    if let Some(node) = self.topology.get(*node_id).cloned() {
                        info!(node = %node_id.short(), address = %node.address, "Node joined");
                        self.emit(DiscoveryEvent::NodeJoined { node });
                    }
                }
                if *node_id == self.local.id && self.join_state == JoinState::Pending {
                    info!(node = %self.local.id.short(), "Joined ring");
                    self.set_state(JoinState::Alive);
                }
            }
            Payload::NodeLeft { node_id } => match self.topology.mark_left(*node_id, envelope.message_id) {
                Ok(true) if *node_id != self.local.id => {
                    info!(node = %node_id.short(), "Node left");
                    self.forget_node(*node_id);
                    self.emit(DiscoveryEvent::NodeLeft { node_id: *node_id });
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "NodeLeft for unknown node"),
            },
            Payload::NodeFailed { node_id, reason } => {
                if *node_id == self.local.id {
                    self.segment();
                    return;
                }
                self.failed_reported.insert(*node_id);
                match self.topology.mark_failed(*node_id, envelope.message_id) {
                    Ok(true) => {
                        warn!(node = %node_id.short(), reason = %reason, "Node failed");
                        self.forget_node(*node_id);
                        self.emit(DiscoveryEvent::NodeFailed { node_id: *node_id });
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "NodeFailed for unknown node"),
                }
            }
            Payload::Discard { thru_message_id } => self.apply_discard(*thru_message_id),
            Payload::Heartbeat { node_id, metrics } => {
                self.topology.update_metrics(*node_id, metrics.clone());
                if *node_id != self.local.id {
                    self.detector.heartbeat(*node_id, now);
                    if self.skipped.remove(node_id) {
                        info!(node = %node_id.short(), "Skipped node is heartbeating again");
                    }
                }
            }
            Payload::Custom { user_payload } => {
                self.emit(DiscoveryEvent::CustomMessage {
                    creator: envelope.creator,
                    message_id: envelope.message_id,
                    payload: user_payload.clone(),
                });
            }
        }
    }

    fn apply_discard(&mut self, thru: MessageId) {
        if let Some(index) = self.history.discard_through(thru) {
            let dropped = self.ensure_log.discard_through(index);
            debug!(thru = %thru, history = self.history.len(), ensure_dropped = dropped, "History discarded");
        }
        let history = &self.history;
        let purged = self.topology.purge_tombstones(|id| history.contains(id));
        for node in purged {
            self.skipped.remove(&node.id);
            self.detector.untrack(node.id);
            self.delivery.forget(node.id);
            self.failed_reported.remove(&node.id);
            self.finish_resumed.remove(&node.id);
            trace!(node = %node.id.short(), "Purged node forgotten");
        }
    }

    fn forget_node(&mut self, node: NodeId) {
        self.detector.untrack(node);
        self.skipped.remove(&node);
    }

    fn segment(&mut self) {
        error!(node = %self.local.id.short(), "Declared failed by the ring, stopping");
        self.emit(DiscoveryEvent::Segmented);
        self.set_state(JoinState::Segmented);
        if self.successor.take().is_some() {
            self.push_transport(TransportCommand::SetSuccessor(None));
        }
    }

    fn complete_leave(&mut self) {
        self.set_state(JoinState::Left);
        self.actions.push(Action::LeaveCompleted);
    }

    // ------------------------------------------------------------------
    // Join, member side
    // ------------------------------------------------------------------

    fn on_join_request(&mut self, mut envelope: Envelope, now: Instant) {
        let (candidate, responded) = match &envelope.payload {
            Payload::JoinRequest { candidate, responded } => (candidate.clone(), *responded),
            _ => return,
        };
        if !self.join_state.is_member() || self.join_state == JoinState::Leaving {
            debug!(candidate = %candidate.id.short(), "Not a member, ignoring join request");
            return;
        }

        if !envelope.verified {
            if let Some(existing) = self.topology.get(candidate.id) {
                if existing.address != candidate.address {
                    warn!(candidate = %candidate.id.short(), "Join request with duplicate node id");
                    self.reject(&candidate, RejectReason::DuplicateId);
                    return;
                }
            }
            envelope.verified = true;
        }

        if self.topology.is_coordinator(self.local.id) {
            self.review_join(envelope, candidate, responded, now);
        } else if responded {
            trace!(candidate = %candidate.id.short(), "Answered join request dropped");
        } else if self.relayed_joins.insert(envelope.message_id) {
            debug!(candidate = %candidate.id.short(), "Relaying join request toward coordinator");
            self.forward(&envelope);
        }
    }

    fn review_join(&mut self, envelope: Envelope, candidate: NodeDescriptor, responded: bool, now: Instant) {
        let decision = self
            .sequencer
            .review(&self.topology, envelope.message_id, &candidate, responded);

        match decision {
            JoinDecision::Admit { order } => match self.topology.admit(candidate.clone(), order, self.local.id) {
                Ok(version) => {
                    info!(
                        candidate = %candidate.id.short(),
                        address = %candidate.address,
                        order,
                        version,
                        "Admitting node"
                    );
                    self.detector.track(candidate.id, now);
                    self.announce_admission(candidate.id, order, version, now);
                    self.pass_answered(envelope);
                }
                Err(e) => warn!(error = %e, "Admission failed"),
            },
            JoinDecision::Readmit { order } => {
                info!(candidate = %candidate.id.short(), order, "Answering repeated join request");
                let version = self.topology.version();
                self.announce_admission(candidate.id, order, version, now);
                self.pass_answered(envelope);
            }
            JoinDecision::Ignore(reason) => {
                debug!(candidate = %candidate.id.short(), reason = ?reason, "Join request ignored");
            }
            JoinDecision::Reject(reason) => self.reject(&candidate, reason),
        }
    }

    fn announce_admission(&mut self, candidate: NodeId, order: u64, version: u64, now: Instant) {
        let admitted = match self.topology.get(candidate) {
            Some(node) => node.clone(),
            None => return,
        };
        let snapshot = self.topology.export(self.delivery.export());
        self.originate(
            Payload::NodeAdded {
                candidate: admitted,
                assigned_order: order,
                topology_version: version,
                snapshot: Box::new(snapshot),
            },
            false,
            now,
        );
    }

    /// Send an answered request on with `responded` set. A successor that
    /// takes over as coordinator before the NodeAdded reaches it then
    /// ignores the request instead of admitting the candidate again;
    /// everyone else drops it.
    fn pass_answered(&mut self, mut envelope: Envelope) {
        if let Payload::JoinRequest { responded, .. } = &mut envelope.payload {
            *responded = true;
        }
        self.forward(&envelope);
    }

    fn reject(&mut self, candidate: &NodeDescriptor, reason: RejectReason) {
        self.push_transport(TransportCommand::Direct {
            address: candidate.address,
            frame: Frame::JoinRejected {
                candidate: candidate.id,
                reason,
            },
            report: false,
        });
    }

    // ------------------------------------------------------------------
    // Ring maintenance
    // ------------------------------------------------------------------

    fn successor_id(&self) -> Option<NodeId> {
        self.successor.as_ref().map(|node| node.id)
    }

    /// Recompute successor and coordinator status. Returns true when the
    /// successor changed; the new one then received the whole history.
    fn refresh_ring(&mut self, now: Instant) -> bool {
        let next = if self.join_state.is_member() {
            self.topology.ring_successor(self.local.id, &self.skipped).cloned()
        } else {
            None
        };

        let coordinator = self.topology.is_coordinator(self.local.id);
        if coordinator && !self.was_coordinator && self.join_state.is_member() {
            info!(node = %self.local.id.short(), version = self.topology.version(), "Acting as coordinator");
            self.was_coordinator = true;
            self.resume_incomplete(now);
        } else if !coordinator {
            self.was_coordinator = false;
        }

        if next.as_ref().map(|node| node.id) == self.successor_id() {
            self.successor = next;
            return false;
        }

        match &next {
            Some(node) => info!(
                node = %self.local.id.short(),
                successor = %node.id.short(),
                address = %node.address,
                history = self.history.len(),
                "Successor changed, resending history"
            ),
            None => info!(node = %self.local.id.short(), "Alone in the ring"),
        }
        self.successor = next.clone();
        self.push_transport(TransportCommand::SetSuccessor(next));
        if self.successor.is_some() {
            for envelope in self.history.envelopes() {
                self.forward(&envelope);
            }
        }
        true
    }

    fn on_link_failed(&mut self, node: NodeId, reason: &str, now: Instant) {
        let failure = DiscoveryError::Link {
            node,
            reason: reason.to_string(),
        };
        warn!(error = %failure, "Skipping unreachable successor");
        if self.successor_id() == Some(node) {
            self.skipped.insert(node);
        }
        if let Some(verdict) = self.detector.suspect(node, now) {
            self.handle_verdict(verdict, now);
        }
        self.refresh_ring(now);
    }

    fn handle_verdict(&mut self, verdict: Verdict, now: Instant) {
        match verdict {
            Verdict::Probe(node) => match self.topology.get(node) {
                Some(descriptor) if descriptor.state.is_alive() => {
                    let address = descriptor.address;
                    self.push_transport(TransportCommand::Probe { node, address });
                }
                _ => self.detector.untrack(node),
            },
            Verdict::Failed(node) => self.report_failure(node, "no heartbeat and no probe answer", now),
        }
    }

    /// Put NodeFailed on the ring, once per node
    fn report_failure(&mut self, node: NodeId, reason: &str, now: Instant) {
        if !self.topology.is_alive(node) || !self.failed_reported.insert(node) {
            return;
        }
        warn!(node = %node.short(), reason, "Reporting node failure");
        self.originate(
            Payload::NodeFailed {
                node_id: node,
                reason: reason.to_string(),
            },
            false,
            now,
        );
    }

    // ------------------------------------------------------------------
    // Resynchronisation
    // ------------------------------------------------------------------

    fn park(&mut self, envelope: Envelope) {
        if self.parked.len() >= self.config.resync_capacity {
            if let Some(dropped) = self.parked.pop_front() {
                warn!(message_id = %dropped.message_id, "Park queue full, dropping oldest");
            }
        }
        self.parked.push_back(envelope);
    }

    fn request_resync(&mut self, now: Instant) {
        if self.resync_requested_at.is_some() {
            return;
        }
        match self.topology.ring_predecessor(self.local.id, &self.skipped) {
            Some(predecessor) => {
                info!(predecessor = %predecessor.id.short(), "Requesting topology snapshot");
                let address = predecessor.address;
                self.push_transport(TransportCommand::Direct {
                    address,
                    frame: Frame::SnapshotRequest {
                        requester: self.local.id,
                        address: self.local.address,
                    },
                    report: false,
                });
                self.resync_requested_at = Some(now);
            }
            None => {
                self.replay_parked(now, true);
            }
        }
    }

    fn on_snapshot(&mut self, from: NodeId, snapshot: TopologySnapshot, now: Instant) {
        if self.resync_requested_at.is_none() || !self.join_state.is_member() {
            debug!(from = %from.short(), "Unrequested snapshot ignored");
            return;
        }

        let local_state = snapshot
            .nodes
            .iter()
            .find(|node| node.id == self.local.id)
            .map(|node| node.state);
        match local_state {
            Some(NodeState::Failed) => {
                self.segment();
                return;
            }
            Some(_) if snapshot.version >= self.topology.version() => {
                info!(from = %from.short(), version = snapshot.version, "Restoring topology from snapshot");
                self.delivery.merge(&snapshot.watermarks);
                let diff = self.topology.restore(snapshot);
                for node in &diff.joined {
                    self.detector.track(node.id, now);
                }
                for node in diff.left.iter().chain(diff.failed.iter()) {
                    self.forget_node(*node);
                }
                self.emit_diff(diff);
            }
            _ => {
                debug!(from = %from.short(), "Snapshot older than local topology, merging watermarks only");
                self.delivery.merge(&snapshot.watermarks);
            }
        }

        self.refresh_ring(now);
        self.resync_requested_at = None;
        if !self.replay_parked(now, false) {
            // Still missing messages; the resync timeout accepts across the gap
            debug!(parked = self.parked.len(), "Gap remains after snapshot");
            self.resync_requested_at = Some(now);
        }
    }

    /// Run parked envelopes through the receive path again. Already covered
    /// ones are recorded and forwarded without being applied. Returns false
    /// when a gap stopped the replay; the rest stays parked.
    fn replay_parked(&mut self, now: Instant, force: bool) -> bool {
        let mut parked = std::mem::take(&mut self.parked);
        while let Some(envelope) = parked.pop_front() {
            if !self.join_state.is_member() {
                break;
            }
            if envelope.message_id.is_direct() {
                continue;
            }
            match self.delivery.classify(envelope.creator, envelope.seq()) {
                Delivery::Fresh => self.accept(envelope, now),
                Delivery::Duplicate if envelope.creator == self.local.id => self.on_own_return(&envelope, now),
                Delivery::Duplicate => {
                    self.record(&envelope, now);
                    self.forward(&envelope);
                }
                Delivery::Gap { expected } if force => {
                    warn!(
                        creator = %envelope.creator.short(),
                        expected,
                        received = envelope.seq(),
                        "Accepting message across a gap"
                    );
                    self.accept(envelope, now);
                }
                Delivery::Gap { .. } => {
                    parked.push_front(envelope);
                    self.parked = parked;
                    return false;
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Coordinator duties
    // ------------------------------------------------------------------

    fn maybe_discard(&mut self, now: Instant) {
        let safe = match self.own_completed {
            Some(safe) => safe,
            None => return,
        };
        if let Some(last) = self.last_discard_emitted {
            if safe.seq() <= last.seq() {
                return;
            }
        }
        let batch_full = self.since_discard >= self.config.discard_batch;
        let interval_elapsed =
            now.saturating_duration_since(self.last_discard_at) >= self.config.discard_interval;
        if !batch_full && !interval_elapsed {
            return;
        }

        debug!(thru = %safe, accepted = self.since_discard, "Emitting discard");
        self.last_discard_emitted = Some(safe);
        self.last_discard_at = now;
        self.since_discard = 0;
        self.originate(Payload::Discard { thru_message_id: safe }, false, now);
    }

    /// Finish work a dead coordinator left behind
    fn resume_incomplete(&mut self, now: Instant) {
        let orphaned: Vec<NodeId> = self
            .topology
            .pending_joins()
            .filter(|(node, admitted_by)| {
                *admitted_by != self.local.id
                    && !self.topology.is_alive(*admitted_by)
                    && !self.finish_resumed.contains(node)
            })
            .map(|(node, _)| node)
            .collect();
        for node in orphaned {
            self.finish_resumed.insert(node);
            info!(node = %node.short(), cause = %DiscoveryError::CoordinatorLost, "Finishing incomplete join");
            self.originate(Payload::NodeAddFinished { node_id: node }, true, now);
        }

        let stale = self.ensure_log.stale(now, self.config.ensure_delivery_timeout);
        for mut envelope in stale {
            if envelope.creator == self.local.id || self.topology.is_alive(envelope.creator) {
                continue;
            }
            self.ensure_log.mark_reinjected(envelope.message_id);
            info!(
                message_id = %envelope.message_id,
                kind = envelope.payload.kind(),
                "Re-injecting ensure-delivery message"
            );
            envelope.pending = Some(self.local.id);
            self.forward(&envelope);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn metrics(&self, now: Instant) -> NodeMetrics {
        NodeMetrics {
            cpu_cores: self.local.metrics.cpu_cores,
            messages_received: self.messages_received,
            messages_forwarded: self.messages_forwarded,
            history_len: self.history.len(),
            topology_version: self.topology.version(),
            uptime_ms: now.saturating_duration_since(self.started_at).as_millis() as u64,
            updated_at_ms: unix_millis(),
        }
    }

    fn emit_diff(&mut self, diff: TopologyDiff) {
        for node in diff.joined {
            if node.id != self.local.id {
                self.emit(DiscoveryEvent::NodeJoined { node });
            }
        }
        for node_id in diff.left {
            self.emit(DiscoveryEvent::NodeLeft { node_id });
        }
        for node_id in diff.failed {
            self.failed_reported.insert(node_id);
            self.emit(DiscoveryEvent::NodeFailed { node_id });
        }
    }

    fn emit(&mut self, event: DiscoveryEvent) {
        self.actions.push(Action::Event(event));
    }

    fn push_transport(&mut self, command: TransportCommand) {
        self.actions.push(Action::Transport(command));
    }

    fn set_state(&mut self, state: JoinState) {
        if self.join_state == state {
            return;
        }
        debug!(node = %self.local.id.short(), from = %self.join_state, to = %state, "Join state changed");
        self.join_state = state;
        self.actions.push(Action::JoinStateChanged(state));
    }
}
