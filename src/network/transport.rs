//! TCP ring transport
//!
//! One accept loop with a reader task per inbound connection, and a single
//! writer task owning the outbound link to the successor. Direct frames and
//! probes use short-lived connections of their own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use super::{RingTransport, TransportCommand, TransportEvent};
use crate::config::NetworkConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::message::{read_frame, write_frame, Frame, PROTOCOL_VERSION};
use crate::types::{NodeDescriptor, NodeId};

/// Transport statistics
#[derive(Debug, Default, Clone)]
pub struct TransportStats {
    /// Connections accepted by the listener
    pub connections_accepted: u64,
    /// Outbound ring connections established
    pub connections_established: u64,
    /// Outbound ring links declared failed
    pub links_failed: u64,
    /// Envelopes written to the successor
    pub frames_sent: u64,
    /// Frames handed to the apply loop
    pub frames_received: u64,
}

/// TCP implementation of [`RingTransport`]
#[derive(Debug)]
pub struct TcpRingTransport {
    local_id: NodeId,
    bind_address: SocketAddr,
    config: NetworkConfig,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    writer: Option<JoinHandle<()>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    stats: Arc<RwLock<TransportStats>>,
}

impl TcpRingTransport {
    pub fn new(local_id: NodeId, bind_address: SocketAddr, config: NetworkConfig) -> Self {
        Self {
            local_id,
            bind_address,
            config,
            outbound: None,
            writer: None,
            events: None,
            shutdown_tx: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
        }
    }

    /// Bound address; the configured one until `start` resolves it
    pub fn local_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub async fn stats(&self) -> TransportStats {
        self.stats.read().await.clone()
    }

    async fn accept_loop(
        listener: TcpListener,
        local_id: NodeId,
        config: NetworkConfig,
        events: mpsc::Sender<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<RwLock<TransportStats>>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            stats.write().await.connections_accepted += 1;
                            let config = config.clone();
                            let events = events.clone();
                            let shutdown = shutdown.clone();
                            let stats = Arc::clone(&stats);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, local_id, config, events, shutdown, stats).await {
                                    debug!(peer = %addr, error = %e, "Inbound connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
        debug!("Accept loop stopped");
    }

    /// Read frames from one inbound connection until it closes
    async fn handle_connection(
        stream: TcpStream,
        local_id: NodeId,
        config: NetworkConfig,
        events: mpsc::Sender<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<RwLock<TransportStats>>,
    ) -> DiscoveryResult<()> {
        let max = config.max_frame_size;
        let mut buffer = BytesMut::with_capacity(4096);
        let (mut reader, mut writer) = stream.into_split();

        let peer = match timeout(config.connect_timeout, read_frame(&mut reader, &mut buffer, max)).await?? {
            Some(Frame::Handshake {
                node_id,
                protocol_version,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(DiscoveryError::Protocol(format!(
                        "unsupported protocol version {}",
                        protocol_version
                    )));
                }
                node_id
            }
            Some(other) => {
                return Err(DiscoveryError::Protocol(format!(
                    "expected handshake, got {}",
                    other.kind()
                )));
            }
            None => return Ok(()),
        };
        trace!(peer = %peer.short(), "Inbound connection established");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = read_frame(&mut reader, &mut buffer, max) => {
                    match frame? {
                        None => break,
                        Some(Frame::Probe { .. }) => {
                            write_frame(&mut writer, &Frame::ProbeAck { node_id: local_id }, max).await?;
                        }
                        Some(Frame::Handshake { .. }) => {
                            return Err(DiscoveryError::Protocol("repeated handshake".to_string()));
                        }
                        Some(frame) => {
                            stats.write().await.frames_received += 1;
                            // Blocks this reader when the apply loop falls behind
                            if events.send(TransportEvent::Frame { from: peer, frame }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Owns the only outbound ring link; commands are handled strictly in order
    async fn run_writer(
        local_id: NodeId,
        config: NetworkConfig,
        mut commands: mpsc::UnboundedReceiver<TransportCommand>,
        events: mpsc::Sender<TransportEvent>,
        stats: Arc<RwLock<TransportStats>>,
    ) {
        let mut successor: Option<NodeDescriptor> = None;
        let mut link: Option<TcpStream> = None;
        let mut broken = false;

        while let Some(command) = commands.recv().await {
            match command {
                TransportCommand::SetSuccessor(next) => {
                    let current = successor.as_ref().map(|node| (node.id, node.address));
                    let proposed = next.as_ref().map(|node| (node.id, node.address));
                    if current != proposed {
                        link = None;
                        broken = false;
                        if let Some(node) = &next {
                            debug!(successor = %node.id.short(), address = %node.address, "Outbound link re-pointed");
                        }
                    }
                    successor = next;
                }
                TransportCommand::Forward(envelope) => {
                    let target = match &successor {
                        Some(target) if !broken => target.clone(),
                        _ => continue,
                    };
                    let frame = Frame::Envelope(envelope);
                    match Self::deliver(&mut link, local_id, &target, &frame, &config, &stats).await {
                        Ok(()) => stats.write().await.frames_sent += 1,
                        Err(e @ DiscoveryError::FrameTooLarge { .. }) | Err(e @ DiscoveryError::Codec(_)) => {
                            warn!(error = %e, "Dropping unencodable frame");
                        }
                        Err(e) => {
                            warn!(successor = %target.id.short(), error = %e, "Link to successor failed");
                            broken = true;
                            link = None;
                            stats.write().await.links_failed += 1;
                            let failed = TransportEvent::LinkFailed {
                                node: target.id,
                                reason: e.to_string(),
                            };
                            if events.send(failed).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                other => {
                    debug!(command = ?other, "Writer ignoring non-ring command");
                }
            }
        }
        debug!("Outbound writer stopped");
    }

    async fn deliver(
        link: &mut Option<TcpStream>,
        local_id: NodeId,
        target: &NodeDescriptor,
        frame: &Frame,
        config: &NetworkConfig,
        stats: &Arc<RwLock<TransportStats>>,
    ) -> DiscoveryResult<()> {
        if let Some(stream) = link.as_mut() {
            match timeout(config.write_timeout, write_frame(stream, frame, config.max_frame_size)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e @ DiscoveryError::FrameTooLarge { .. })) | Ok(Err(e @ DiscoveryError::Codec(_))) => {
                    return Err(e)
                }
                _ => {
                    debug!(successor = %target.id.short(), "Stale outbound link, reconnecting");
                    *link = None;
                }
            }
        }

        let mut stream = connect(target.address, local_id, config, config.connect_attempts).await?;
        stats.write().await.connections_established += 1;
        info!(successor = %target.id.short(), address = %target.address, "Connected to successor");
        timeout(config.write_timeout, write_frame(&mut stream, frame, config.max_frame_size)).await??;
        *link = Some(stream);
        Ok(())
    }

    async fn send_direct(
        local_id: NodeId,
        address: SocketAddr,
        frame: Frame,
        report: bool,
        config: NetworkConfig,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let result: DiscoveryResult<()> = async {
            let mut stream = connect(address, local_id, &config, config.connect_attempts).await?;
            timeout(config.write_timeout, write_frame(&mut stream, &frame, config.max_frame_size)).await??;
            stream.shutdown().await?;
            Ok(())
        }
        .await;

        let event = match result {
            Ok(()) => {
                trace!(address = %address, kind = frame.kind(), "Direct frame delivered");
                TransportEvent::DirectDelivered { address }
            }
            Err(e) => {
                debug!(address = %address, kind = frame.kind(), error = %e, "Direct frame failed");
                TransportEvent::DirectFailed {
                    address,
                    reason: e.to_string(),
                }
            }
        };
        if report {
            let _ = events.send(event).await;
        }
    }

    async fn probe(
        local_id: NodeId,
        node: NodeId,
        address: SocketAddr,
        config: NetworkConfig,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let result: DiscoveryResult<bool> = async {
            let mut stream = connect(address, local_id, &config, 1).await?;
            write_frame(&mut stream, &Frame::Probe { node_id: local_id }, config.max_frame_size).await?;
            let mut buffer = BytesMut::new();
            let answer = timeout(
                config.connect_timeout,
                read_frame(&mut stream, &mut buffer, config.max_frame_size),
            )
            .await??;
            Ok(matches!(answer, Some(Frame::ProbeAck { node_id }) if node_id == node))
        }
        .await;

        let alive = match result {
            Ok(alive) => alive,
            Err(e) => {
                debug!(node = %node.short(), error = %e, "Probe failed");
                false
            }
        };
        let _ = events.send(TransportEvent::ProbeResult { node, alive }).await;
    }
}

/// Connect and handshake, retrying with linear backoff
async fn connect(
    address: SocketAddr,
    local_id: NodeId,
    config: &NetworkConfig,
    attempts: u32,
) -> DiscoveryResult<TcpStream> {
    let attempts = attempts.max(1);
    let mut last_error = std::io::Error::new(std::io::ErrorKind::Other, "no connection attempt made");

    for attempt in 1..=attempts {
        match timeout(config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.set_nodelay(true);
                let handshake = Frame::Handshake {
                    node_id: local_id,
                    protocol_version: PROTOCOL_VERSION,
                };
                write_frame(&mut stream, &handshake, config.max_frame_size).await?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
            }
        }
        trace!(address = %address, attempt, "Connect attempt failed");
        if attempt < attempts {
            sleep(config.retry_backoff * attempt).await;
        }
    }
    Err(DiscoveryError::Io(last_error))
}

#[async_trait]
impl RingTransport for TcpRingTransport {
    async fn start(&mut self, events: mpsc::Sender<TransportEvent>) -> DiscoveryResult<SocketAddr> {
        let listener = TcpListener::bind(self.bind_address)
            .await
            .map_err(|source| DiscoveryError::Bind {
                address: self.bind_address,
                source,
            })?;
        self.bind_address = listener.local_addr().map_err(|source| DiscoveryError::Bind {
            address: self.bind_address,
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(Self::accept_loop(
            listener,
            self.local_id,
            self.config.clone(),
            events.clone(),
            shutdown_rx,
            Arc::clone(&self.stats),
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        self.writer = Some(tokio::spawn(Self::run_writer(
            self.local_id,
            self.config.clone(),
            outbound_rx,
            events.clone(),
            Arc::clone(&self.stats),
        )));
        self.events = Some(events);

        info!(node = %self.local_id.short(), address = %self.bind_address, "Ring transport listening");
        Ok(self.bind_address)
    }

    fn dispatch(&self, command: TransportCommand) {
        let events = match &self.events {
            Some(events) => events.clone(),
            None => {
                warn!(command = ?command, "Transport not started, dropping command");
                return;
            }
        };

        match command {
            TransportCommand::SetSuccessor(_) | TransportCommand::Forward(_) => {
                if let Some(outbound) = &self.outbound {
                    if outbound.send(command).is_err() {
                        debug!("Outbound writer gone, dropping ring command");
                    }
                }
            }
            TransportCommand::Direct {
                address,
                frame,
                report,
            } => {
                tokio::spawn(Self::send_direct(
                    self.local_id,
                    address,
                    frame,
                    report,
                    self.config.clone(),
                    events,
                ));
            }
            TransportCommand::Probe { node, address } => {
                tokio::spawn(Self::probe(self.local_id, node, address, self.config.clone(), events));
            }
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        // Closing the queue lets the writer finish what is already enqueued
        self.outbound = None;
        if let Some(mut writer) = self.writer.take() {
            tokio::select! {
                _ = &mut writer => {}
                _ = sleep(grace) => {
                    warn!("Outbound link not drained within grace period");
                    writer.abort();
                }
            }
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        self.events = None;
        let stats = self.stats().await;
        info!(
            node = %self.local_id.short(),
            frames_sent = stats.frames_sent,
            frames_received = stats.frames_received,
            links_failed = stats.links_failed,
            "Ring transport stopped"
        );
    }
}
