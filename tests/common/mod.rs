//! Deterministic in-memory ring
//!
//! Drives real `DiscoveryEngine`s on a virtual clock. Actions are routed
//! through a single FIFO queue, which keeps every link in order. Nodes can
//! be taken down: frames to them fail the way the TCP transport reports it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gridring::cluster::JoinState;
use gridring::config::RingConfig;
use gridring::discovery::{Action, DiscoveryEngine, DiscoveryEvent};
use gridring::message::{Envelope, Frame, Payload};
use gridring::network::{TransportCommand, TransportEvent};
use gridring::types::{MessageId, NodeDescriptor, NodeId, NodeState};

const MAX_STEPS: usize = 1_000_000;

pub struct SimNode {
    pub engine: DiscoveryEngine,
    pub up: bool,
    pub events: Vec<DiscoveryEvent>,
    pub states: Vec<JoinState>,
    pub leave_completed: bool,
    /// Join requests this node passed on after answering them
    pub answered: Vec<Envelope>,
    /// Messages this node put back on the ring for a dead creator
    pub reinjected: Vec<MessageId>,
    /// NodeFailed messages this node created, with their subject
    pub reported: Vec<(MessageId, NodeId)>,
    successor: Option<NodeId>,
    broken: bool,
}

impl SimNode {
    pub fn id(&self) -> NodeId {
        self.engine.local().id
    }

    pub fn address(&self) -> SocketAddr {
        self.engine.local().address
    }

    pub fn alive_ids(&self) -> Vec<NodeId> {
        self.engine
            .snapshot()
            .into_iter()
            .filter(|node| node.state == NodeState::Alive)
            .map(|node| node.id)
            .collect()
    }

    pub fn joined(&self, node: NodeId) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, DiscoveryEvent::NodeJoined { node: n } if n.id == node))
            .count()
    }

    pub fn failed(&self, node: NodeId) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, DiscoveryEvent::NodeFailed { node_id } if *node_id == node))
            .count()
    }

    pub fn left(&self, node: NodeId) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, DiscoveryEvent::NodeLeft { node_id } if *node_id == node))
            .count()
    }

    /// Custom payloads received from `creator`, in delivery order
    pub fn custom_from(&self, creator: NodeId) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                DiscoveryEvent::CustomMessage { creator: c, payload, .. } if *c == creator => {
                    Some(payload.to_vec())
                }
                _ => None,
            })
            .collect()
    }
}

pub struct Simulation {
    pub nodes: Vec<SimNode>,
    queue: VecDeque<(usize, TransportEvent)>,
    base: Instant,
    elapsed: Duration,
    next_port: u16,
    pub template: RingConfig,
}

impl Simulation {
    pub fn new() -> Self {
        Self::with_config(RingConfig::default())
    }

    pub fn with_config(template: RingConfig) -> Self {
        Self {
            nodes: Vec::new(),
            queue: VecDeque::new(),
            base: Instant::now(),
            elapsed: Duration::ZERO,
            next_port: 7000,
            template,
        }
    }

    pub fn now(&self) -> Instant {
        self.base + self.elapsed
    }

    pub fn next_address(&mut self) -> SocketAddr {
        let address = SocketAddr::from(([127, 0, 0, 1], self.next_port));
        self.next_port += 1;
        address
    }

    /// Add a node joining through the given seeds and run until quiet
    pub fn add_node(&mut self, seeds: Vec<SocketAddr>) -> usize {
        let address = self.next_address();
        self.add_node_with(NodeId::new(), address, seeds, self.template.clone())
    }

    pub fn add_node_with(&mut self, id: NodeId, address: SocketAddr, seeds: Vec<SocketAddr>, config: RingConfig) -> usize {
        let index = self.spawn_node(id, address, seeds, config);
        self.run_until_quiet();
        index
    }

    /// Start a node without delivering anything yet
    pub fn spawn_node(&mut self, id: NodeId, address: SocketAddr, seeds: Vec<SocketAddr>, mut config: RingConfig) -> usize {
        config.node.seeds = seeds;
        let local = NodeDescriptor::new(id, address);
        let now = self.now();
        let mut engine = DiscoveryEngine::with_defaults(local, &config, now);
        engine.start(now);
        self.nodes.push(SimNode {
            engine,
            up: true,
            events: Vec::new(),
            states: Vec::new(),
            leave_completed: false,
            answered: Vec::new(),
            reinjected: Vec::new(),
            reported: Vec::new(),
            successor: None,
            broken: false,
        });
        let index = self.nodes.len() - 1;
        self.flush(index);
        index
    }

    /// Bootstrap a ring of `count` nodes, each joining through the first
    pub fn ring(count: usize) -> Self {
        let mut sim = Self::new();
        sim.grow(count);
        sim
    }

    pub fn grow(&mut self, count: usize) {
        for _ in 0..count {
            let seeds = match self.nodes.first() {
                Some(first) => vec![first.address()],
                None => Vec::new(),
            };
            self.add_node(seeds);
            self.settle();
        }
    }

    pub fn id(&self, index: usize) -> NodeId {
        self.nodes[index].id()
    }

    pub fn address(&self, index: usize) -> SocketAddr {
        self.nodes[index].address()
    }

    pub fn engine(&self, index: usize) -> &DiscoveryEngine {
        &self.nodes[index].engine
    }

    pub fn engine_mut(&mut self, index: usize) -> &mut DiscoveryEngine {
        &mut self.nodes[index].engine
    }

    /// Crash a node: it stops processing and its peers see dead links
    pub fn take_down(&mut self, index: usize) {
        self.nodes[index].up = false;
    }

    pub fn up_nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter().filter(|node| node.up && !node.engine.join_state().is_terminal())
    }

    /// Deliver a frame to a node as if `from` had sent it
    pub fn inject(&mut self, target: usize, from: NodeId, frame: Frame) {
        self.queue.push_back((target, TransportEvent::Frame { from, frame }));
        self.run_until_quiet();
    }

    /// Queue a transport event for a node without running the queue
    pub fn deliver(&mut self, target: usize, event: TransportEvent) {
        self.queue.push_back((target, event));
    }

    /// Broadcast a custom payload from a node and deliver it everywhere
    pub fn broadcast(&mut self, index: usize, payload: &[u8], ensure_delivery: bool) -> MessageId {
        let now = self.now();
        let id = self.nodes[index]
            .engine
            .broadcast(Bytes::copy_from_slice(payload), ensure_delivery, now)
            .expect("broadcast from a member");
        self.flush(index);
        self.run_until_quiet();
        id
    }

    pub fn leave(&mut self, index: usize) {
        let now = self.now();
        self.nodes[index].engine.leave(now).expect("leave from a member");
        self.flush(index);
        self.run_until_quiet();
    }

    /// Collect actions a test triggered directly on an engine
    pub fn flush(&mut self, index: usize) {
        let actions = self.nodes[index].engine.drain_actions();
        for action in actions {
            self.route(index, action);
        }
    }

    /// Process queued deliveries one by one until `done` holds
    pub fn run_until<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut(&Simulation) -> bool,
    {
        for _ in 0..MAX_STEPS {
            if done(self) {
                return true;
            }
            if !self.step() {
                return done(self);
            }
        }
        panic!("simulation did not quiesce");
    }

    pub fn run_until_quiet(&mut self) {
        self.run_until(|_| false);
    }

    /// Advance the clock in tick-sized steps, ticking every live node
    pub fn advance(&mut self, duration: Duration) {
        let step = self.template.discovery.tick_interval;
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            let delta = remaining.min(step);
            self.elapsed += delta;
            remaining -= delta;
            let now = self.now();
            for index in 0..self.nodes.len() {
                if self.nodes[index].up {
                    self.nodes[index].engine.tick(now);
                    self.flush(index);
                }
            }
            self.run_until_quiet();
        }
    }

    /// Give joins, discards and heartbeats time to complete
    pub fn settle(&mut self) {
        self.advance(Duration::from_secs(2));
    }

    fn step(&mut self) -> bool {
        let (target, event) = match self.queue.pop_front() {
            Some(item) => item,
            None => return false,
        };
        if self.nodes[target].up {
            let now = self.now();
            self.nodes[target].engine.on_transport_event(event, now);
            self.flush(target);
        }
        true
    }

    fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id() == id)
    }

    fn index_at(&self, address: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|node| node.address() == address)
    }

    /// Crashed and stopped nodes accept no connections
    fn reachable(&self, index: Option<usize>) -> Option<usize> {
        index.filter(|i| self.nodes[*i].up && !self.nodes[*i].engine.join_state().is_terminal())
    }

    fn observe_forward(&mut self, index: usize, envelope: &Envelope) {
        let node = &mut self.nodes[index];
        let local = node.id();
        match &envelope.payload {
            Payload::JoinRequest { responded: true, .. } => node.answered.push(envelope.clone()),
            Payload::NodeFailed { node_id, .. } if envelope.creator == local => {
                let report = (envelope.message_id, *node_id);
                if !node.reported.contains(&report) {
                    node.reported.push(report);
                }
            }
            _ => {}
        }
        if envelope.pending == Some(local) && !node.reinjected.contains(&envelope.message_id) {
            node.reinjected.push(envelope.message_id);
        }
    }

    fn route(&mut self, index: usize, action: Action) {
        let from = self.nodes[index].id();
        match action {
            Action::Transport(TransportCommand::SetSuccessor(successor)) => {
                self.nodes[index].successor = successor.map(|node| node.id);
                self.nodes[index].broken = false;
            }
            Action::Transport(TransportCommand::Forward(envelope)) => {
                self.observe_forward(index, &envelope);
                let successor = match self.nodes[index].successor {
                    Some(successor) => successor,
                    None => return,
                };
                if self.nodes[index].broken {
                    return;
                }
                match self.reachable(self.index_of(successor)) {
                    Some(target) => self.queue.push_back((
                        target,
                        TransportEvent::Frame {
                            from,
                            frame: Frame::Envelope(envelope),
                        },
                    )),
                    None => {
                        self.nodes[index].broken = true;
                        self.queue.push_back((
                            index,
                            TransportEvent::LinkFailed {
                                node: successor,
                                reason: "connection refused".to_string(),
                            },
                        ));
                    }
                }
            }
            Action::Transport(TransportCommand::Direct { address, frame, report }) => {
                match self.reachable(self.index_at(address)) {
                    Some(target) => {
                        self.queue.push_back((target, TransportEvent::Frame { from, frame }));
                        if report {
                            self.queue.push_back((index, TransportEvent::DirectDelivered { address }));
                        }
                    }
                    None if report => self.queue.push_back((
                        index,
                        TransportEvent::DirectFailed {
                            address,
                            reason: "connection refused".to_string(),
                        },
                    )),
                    None => {}
                }
            }
            Action::Transport(TransportCommand::Probe { node, .. }) => {
                let alive = self.reachable(self.index_of(node)).is_some();
                self.queue.push_back((index, TransportEvent::ProbeResult { node, alive }));
            }
            Action::Event(event) => self.nodes[index].events.push(event),
            Action::JoinStateChanged(state) => self.nodes[index].states.push(state),
            Action::LeaveCompleted => self.nodes[index].leave_completed = true,
        }
    }
}
