//! Ring transport
//!
//! The apply loop talks to the network only through [`TransportCommand`]s
//! it dispatches without waiting and [`TransportEvent`]s it receives on a
//! bounded queue.

pub mod transport;

pub use transport::*;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DiscoveryResult;
use crate::message::{Envelope, Frame};
use crate::types::{NodeDescriptor, NodeId};

/// Work for the transport
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Re-point the single outbound ring link
    SetSuccessor(Option<NodeDescriptor>),
    /// Queue an envelope on the ring link
    Forward(Envelope),
    /// One-off frame to an address outside the ring link
    Direct {
        address: SocketAddr,
        frame: Frame,
        /// Report delivery or failure back as an event
        report: bool,
    },
    /// Check liveness of a suspect directly
    Probe { node: NodeId, address: SocketAddr },
}

/// What the transport reports back
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame { from: NodeId, frame: Frame },
    /// The successor stayed unreachable after the retry budget
    LinkFailed { node: NodeId, reason: String },
    DirectDelivered { address: SocketAddr },
    DirectFailed { address: SocketAddr, reason: String },
    ProbeResult { node: NodeId, alive: bool },
}

/// Point-to-point ring transport
#[async_trait]
pub trait RingTransport: Send + Sync {
    /// Bind and start receiving; returns the bound address
    async fn start(&mut self, events: mpsc::Sender<TransportEvent>) -> DiscoveryResult<SocketAddr>;

    /// Hand over a command; never blocks
    fn dispatch(&self, command: TransportCommand);

    /// Drain the outbound link for at most `grace`, then close everything
    async fn shutdown(&mut self, grace: Duration);
}
