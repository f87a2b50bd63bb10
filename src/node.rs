//! Ring node
//!
//! Async shell around [`DiscoveryEngine`]. A single apply-loop task owns the
//! engine and the transport; callers talk to it through a command queue and
//! observe it through a topology watch and an event broadcast.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{JoinState, RejectReason};
use crate::config::RingConfig;
use crate::discovery::{Action, DiscoveryEngine, DiscoveryEvent};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::network::{RingTransport, TcpRingTransport, TransportEvent};
use crate::types::{MessageId, NodeDescriptor, NodeId};

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

/// Published state of the local node
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyView {
    pub version: u64,
    pub join_state: JoinState,
    pub coordinator: Option<NodeId>,
    pub successor: Option<NodeId>,
    /// Members ordered by internal order
    pub members: Vec<NodeDescriptor>,
}

impl TopologyView {
    fn capture(engine: &DiscoveryEngine) -> Self {
        Self {
            version: engine.topology().version(),
            join_state: engine.join_state(),
            coordinator: engine.coordinator().map(|node| node.id),
            successor: engine.successor().map(|node| node.id),
            members: engine.snapshot(),
        }
    }
}

enum Command {
    Broadcast {
        payload: Bytes,
        ensure_delivery: bool,
        reply: oneshot::Sender<DiscoveryResult<MessageId>>,
    },
    Leave {
        reply: oneshot::Sender<DiscoveryResult<()>>,
    },
    Abort,
}

/// Handle to a running ring node
pub struct RingNode {
    local: NodeDescriptor,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<TopologyView>,
    events: broadcast::Sender<DiscoveryEvent>,
    task: Option<JoinHandle<()>>,
}

impl RingNode {
    /// Bind a TCP transport and start joining
    pub async fn start(config: RingConfig) -> DiscoveryResult<Self> {
        config.validate()?;
        let node_id = config.node.node_id.unwrap_or_default();
        let transport = TcpRingTransport::new(node_id, config.node.bind_address, config.network.clone());
        Self::start_with_transport(node_id, config, transport).await
    }

    pub async fn start_with_transport<T>(node_id: NodeId, config: RingConfig, mut transport: T) -> DiscoveryResult<Self>
    where
        T: RingTransport + 'static,
    {
        config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.network.inbound_queue);
        let address = transport.start(inbound_tx).await?;

        let local = NodeDescriptor::new(node_id, address).with_attributes(config.node.attributes.clone());
        info!(node = %node_id.short(), address = %address, seeds = config.node.seeds.len(), "Starting ring node");

        let mut engine = DiscoveryEngine::with_defaults(local.clone(), &config, Instant::now());
        engine.start(Instant::now());

        let (view_tx, view_rx) = watch::channel(TopologyView::capture(&engine));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let apply_loop = ApplyLoop {
            engine,
            transport,
            inbound: inbound_rx,
            commands: commands_rx,
            view: view_tx,
            events: events_tx.clone(),
            leave_reply: None,
            tick_interval: config.discovery.tick_interval,
            leave_grace: config.discovery.leave_grace,
        };
        let task = tokio::spawn(apply_loop.run());

        Ok(Self {
            local,
            commands: commands_tx,
            view: view_rx,
            events: events_tx,
            task: Some(task),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Bound listen address
    pub fn local_address(&self) -> SocketAddr {
        self.local.address
    }

    pub fn join_state(&self) -> JoinState {
        self.view.borrow().join_state
    }

    /// Current members ordered by internal order
    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        self.view.borrow().members.clone()
    }

    pub fn coordinator(&self) -> Option<NodeDescriptor> {
        let view = self.view.borrow();
        let coordinator = view.coordinator?;
        view.members.iter().find(|node| node.id == coordinator).cloned()
    }

    pub fn topology_version(&self) -> u64 {
        self.view.borrow().version
    }

    pub fn topology(&self) -> watch::Receiver<TopologyView> {
        self.view.clone()
    }

    /// Membership and custom message events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Resolve once the node is a full member
    pub async fn wait_joined(&self) -> DiscoveryResult<()> {
        let mut view = self.view.clone();
        loop {
            let state = view.borrow_and_update().join_state;
            match state {
                JoinState::Alive => return Ok(()),
                JoinState::Rejected(RejectReason::DuplicateId) => {
                    return Err(DiscoveryError::DuplicateId(self.local.id))
                }
                JoinState::GaveUp { attempts } => return Err(DiscoveryError::JoinTimeout { attempts }),
                JoinState::Left | JoinState::Segmented => return Err(DiscoveryError::Shutdown),
                _ => {}
            }
            view.changed().await.map_err(|_| DiscoveryError::Shutdown)?;
        }
    }

    /// Send a custom message around the ring
    pub async fn broadcast(&self, payload: impl Into<Bytes>, ensure_delivery: bool) -> DiscoveryResult<MessageId> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Broadcast {
                payload: payload.into(),
                ensure_delivery,
                reply,
            })
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        response.await.map_err(|_| DiscoveryError::Shutdown)?
    }

    /// Leave gracefully and stop
    pub async fn leave(mut self) -> DiscoveryResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Leave { reply })
            .await
            .map_err(|_| DiscoveryError::Shutdown)?;
        let result = response.await.map_err(|_| DiscoveryError::Shutdown)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }

    /// Stop without telling the ring
    pub async fn abort(mut self) {
        let _ = self.commands.send(Command::Abort).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RingNode {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ApplyLoop<T> {
    engine: DiscoveryEngine,
    transport: T,
    inbound: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<TopologyView>,
    events: broadcast::Sender<DiscoveryEvent>,
    leave_reply: Option<oneshot::Sender<DiscoveryResult<()>>>,
    tick_interval: Duration,
    leave_grace: Duration,
}

impl<T: RingTransport> ApplyLoop<T> {
    async fn run(mut self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let node = self.engine.local().id;
        let mut grace = self.leave_grace;

        let mut running = self.apply_actions();
        while running {
            tokio::select! {
                Some(event) = self.inbound.recv() => {
                    self.engine.on_transport_event(event, Instant::now());
                }
                command = self.commands.recv() => match command {
                    Some(Command::Broadcast { payload, ensure_delivery, reply }) => {
                        let result = self.engine.broadcast(payload, ensure_delivery, Instant::now());
                        let _ = reply.send(result);
                    }
                    Some(Command::Leave { reply }) => match self.engine.leave(Instant::now()) {
                        Ok(()) => self.leave_reply = Some(reply),
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    },
                    Some(Command::Abort) | None => {
                        warn!(node = %node.short(), "Stopping without leaving the ring");
                        grace = Duration::ZERO;
                        break;
                    }
                },
                _ = ticker.tick() => self.engine.tick(Instant::now()),
            }
            running = self.apply_actions();
        }

        self.transport.shutdown(grace).await;
        if let Some(reply) = self.leave_reply.take() {
            let _ = reply.send(Ok(()));
        }
        debug!(node = %node.short(), "Apply loop stopped");
    }

    /// Execute pending actions and publish the view. False once the node
    /// reached a terminal state.
    fn apply_actions(&mut self) -> bool {
        for action in self.engine.drain_actions() {
            match action {
                Action::Transport(command) => self.transport.dispatch(command),
                Action::Event(event) => {
                    // No subscribers is fine
                    let _ = self.events.send(event);
                }
                Action::JoinStateChanged(state) => {
                    info!(node = %self.engine.local().id.short(), state = %state, "Node state");
                }
                Action::LeaveCompleted => {
                    if let Some(reply) = self.leave_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        }

        let view = TopologyView::capture(&self.engine);
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        !self.engine.join_state().is_terminal()
    }
}
