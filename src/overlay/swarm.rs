//! Swarm construction and event loop
//!
//! The swarm is owned by a single `SwarmDriver` task. Everything else talks to
//! it through a cloneable `SwarmHandle`, which forwards commands over an mpsc
//! channel and waits on a oneshot for the outcome.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::request_response::{self, OutboundFailure, RequestId};
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, mdns, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::behaviour::{RelayBehaviour, RelayBehaviourEvent};
use super::codec::PING_SIZE;
use super::Overlay;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::responder::Responder;
use crate::wire::SubProtocol;

const COMMAND_BUFFER: usize = 64;

/// Build a TCP + Noise + Yamux swarm and start listening on the configured address.
///
/// Failing to listen is fatal for the daemon, so this returns `anyhow::Result`.
pub fn build_swarm(
    keypair: identity::Keypair,
    config: &Config,
) -> anyhow::Result<Swarm<RelayBehaviour>> {
    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|keypair: &identity::Keypair| {
            RelayBehaviour::new(keypair, config)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })?
        .with_swarm_config(|cfg| {
            cfg.with_idle_connection_timeout(config.idle_connection_timeout())
        })
        .build();

    swarm.listen_on(config.listen_addr.parse()?)?;

    Ok(swarm)
}

#[derive(Debug)]
enum Command {
    Request {
        peer: PeerId,
        protocol: SubProtocol,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Ping {
        peer: PeerId,
        reply: oneshot::Sender<Result<Duration>>,
    },
    Shutdown,
}

/// Cloneable handle to the swarm task.
#[derive(Debug, Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
}

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Ask the swarm task to stop. Dropping the swarm closes every connection.
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("Swarm task already stopped");
        }
    }

    async fn submit<T>(&self, command: Command, reply: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::ChannelClosed)?;
        reply.await.map_err(|_| RelayError::ChannelClosed)?
    }
}

#[async_trait]
impl Overlay for SwarmHandle {
    async fn request(
        &self,
        peer: PeerId,
        protocol: SubProtocol,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Command::Request {
                peer,
                protocol,
                payload,
                reply,
            },
            rx,
        )
        .await
    }

    async fn ping(&self, peer: PeerId) -> Result<Duration> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Ping { peer, reply }, rx).await
    }
}

/// Owns the swarm and drives it until shutdown.
pub struct SwarmDriver {
    swarm: Swarm<RelayBehaviour>,
    commands: mpsc::Receiver<Command>,
    discovered: Option<mpsc::UnboundedSender<PeerId>>,
    responder: Responder,
    pending_requests: HashMap<(SubProtocol, RequestId), oneshot::Sender<Result<Vec<u8>>>>,
    pending_pings: HashMap<RequestId, PendingPing>,
}

struct PendingPing {
    sent_at: Instant,
    nonce: [u8; PING_SIZE],
    reply: oneshot::Sender<Result<Duration>>,
}

impl SwarmDriver {
    /// Wrap `swarm`. Discovered peers are forwarded on `discovered` when set.
    pub fn new(
        swarm: Swarm<RelayBehaviour>,
        responder: Responder,
        discovered: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> (Self, SwarmHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SwarmHandle {
            local_peer_id: *swarm.local_peer_id(),
            commands: tx,
        };
        let driver = Self {
            swarm,
            commands: rx,
            discovered,
            responder,
            pending_requests: HashMap::new(),
            pending_pings: HashMap::new(),
        };
        (driver, handle)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        for (_, reply) in self.pending_requests.drain() {
            let _ = reply.send(Err(RelayError::ChannelClosed));
        }
        for (_, pending) in self.pending_pings.drain() {
            let _ = pending.reply.send(Err(RelayError::ChannelClosed));
        }
        debug!("Swarm event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                peer,
                protocol,
                payload,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .sub_protocol_mut(protocol)
                    .send_request(&peer, payload);
                self.pending_requests.insert((protocol, request_id), reply);
            }
            Command::Ping { peer, reply } => self.probe_liveness(peer, reply),
            Command::Shutdown => {}
        }
    }

    /// Send a fresh nonce; the reply resolves only when the echo or a failure arrives.
    fn probe_liveness(&mut self, peer: PeerId, reply: oneshot::Sender<Result<Duration>>) {
        let mut nonce = [0u8; PING_SIZE];
        nonce[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        nonce[16..].copy_from_slice(Uuid::new_v4().as_bytes());

        let request_id = self.swarm.behaviour_mut().liveness.send_request(&peer, nonce);
        self.pending_pings.insert(
            request_id,
            PendingPing {
                sent_at: Instant::now(),
                nonce,
                reply,
            },
        );
    }

    async fn handle_event<E: std::fmt::Debug>(&mut self, event: SwarmEvent<RelayBehaviourEvent, E>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                established_in,
                ..
            } => {
                trace!("Connected to {} in {:?}", peer_id, established_in);
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                trace!("Connection to {} closed: {:?}", peer_id, cause);
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                trace!("Outgoing connection to {} failed: {}", peer_id, error);
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener error: {}", error);
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(event)) => self.handle_mdns(event),
            SwarmEvent::Behaviour(RelayBehaviourEvent::Liveness(event)) => {
                self.handle_liveness(event)
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Discover(event)) => {
                self.handle_request_response(SubProtocol::Discover, event)
                    .await
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Capture(event)) => {
                self.handle_request_response(SubProtocol::Capture, event)
                    .await
            }
            _ => {}
        }
    }

    fn handle_mdns(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                for (peer, addr) in list {
                    debug!("mDNS discovered peer: {} addr={}", peer, addr);
                    self.swarm.behaviour_mut().add_address(&peer, addr);
                    if let Some(discovered) = &self.discovered {
                        if discovered.send(peer).is_err() {
                            debug!("Discovery dispatcher stopped, dropping {}", peer);
                        }
                    }
                }
            }
            mdns::Event::Expired(list) => {
                for (peer, addr) in list {
                    trace!("mDNS peer expired: {} addr={}", peer, addr);
                }
            }
        }
    }

    fn handle_liveness(&mut self, event: request_response::Event<[u8; PING_SIZE], [u8; PING_SIZE]>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    if self
                        .swarm
                        .behaviour_mut()
                        .liveness
                        .send_response(channel, request)
                        .is_err()
                    {
                        trace!("Ping echo to {} dropped, stream closed", peer);
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(pending) = self.pending_pings.remove(&request_id) {
                        let outcome = if response == pending.nonce {
                            Ok(pending.sent_at.elapsed())
                        } else {
                            Err(RelayError::Transport(format!("ping echo mismatch from {}", peer)))
                        };
                        let _ = pending.reply.send(outcome);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                debug!("Ping to {} failed: {}", peer, error);
                if let Some(pending) = self.pending_pings.remove(&request_id) {
                    let _ = pending.reply.send(Err(RelayError::Unreachable(peer.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                trace!("Ping from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    async fn handle_request_response(
        &mut self,
        protocol: SubProtocol,
        event: request_response::Event<Vec<u8>, Vec<u8>>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = self.responder.answer(protocol, &request).await;
                    if self
                        .swarm
                        .behaviour_mut()
                        .sub_protocol_mut(protocol)
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("{} response to {} dropped, stream closed", protocol, peer);
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_requests.remove(&(protocol, request_id)) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                trace!("{} request to {} failed: {}", protocol, peer, error);
                if let Some(reply) = self.pending_requests.remove(&(protocol, request_id)) {
                    let _ = reply.send(Err(outbound_error(protocol, &peer, error)));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("{} request from {} failed: {}", protocol, peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}

fn outbound_error(protocol: SubProtocol, peer: &PeerId, error: OutboundFailure) -> RelayError {
    match error {
        OutboundFailure::UnsupportedProtocols => RelayError::Unsupported(protocol.to_string()),
        OutboundFailure::DialFailure => RelayError::Unreachable(peer.to_string()),
        OutboundFailure::Timeout => RelayError::Timeout,
        OutboundFailure::ConnectionClosed => {
            RelayError::Transport(format!("connection to {} closed", peer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use libp2p::Multiaddr;
    use tokio::task::JoinHandle;

    #[test]
    fn test_outbound_error_mapping() {
        let peer = PeerId::random();
        assert!(matches!(
            outbound_error(SubProtocol::Discover, &peer, OutboundFailure::UnsupportedProtocols),
            RelayError::Unsupported(p) if p == "/discover/1.0.0"
        ));
        assert!(matches!(
            outbound_error(SubProtocol::Capture, &peer, OutboundFailure::DialFailure),
            RelayError::Unreachable(_)
        ));
        assert!(matches!(
            outbound_error(SubProtocol::Capture, &peer, OutboundFailure::Timeout),
            RelayError::Timeout
        ));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_swarm() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = SwarmHandle {
            local_peer_id: PeerId::random(),
            commands: tx,
        };

        let err = handle.ping(PeerId::random()).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelClosed));
        let err = handle
            .request(PeerId::random(), SubProtocol::Discover, b"discover".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelClosed));
    }

    struct TestNode {
        handle: SwarmHandle,
        addr: Multiaddr,
        task: JoinHandle<()>,
    }

    fn loopback_config(role: NodeRole) -> Config {
        Config {
            role,
            mdns_enabled: false,
            listen_addr: "/ip4/127.0.0.1/tcp/0".to_string(),
            request_timeout_secs: 5,
            ping_timeout_secs: 2,
            ..Config::default()
        }
    }

    async fn first_listen_addr(swarm: &mut Swarm<RelayBehaviour>) -> Multiaddr {
        loop {
            if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
                return address;
            }
        }
    }

    /// Start a node on loopback that already knows how to dial `known`.
    async fn start_node(role: NodeRole, known: &[(PeerId, Multiaddr)]) -> TestNode {
        let config = loopback_config(role);
        let mut swarm = build_swarm(identity::Keypair::generate_ed25519(), &config).unwrap();
        let addr = first_listen_addr(&mut swarm).await;
        for (peer, peer_addr) in known {
            swarm.behaviour_mut().add_address(peer, peer_addr.clone());
        }

        let (driver, handle) = SwarmDriver::new(swarm, Responder::new(role), None);
        TestNode {
            handle,
            addr,
            task: tokio::spawn(driver.run()),
        }
    }

    async fn manager_and_reader() -> (TestNode, TestNode) {
        let manager = start_node(NodeRole::Manager, &[]).await;
        let reader = start_node(
            NodeRole::Reader,
            &[(manager.handle.local_peer_id(), manager.addr.clone())],
        )
        .await;
        (manager, reader)
    }

    #[tokio::test]
    async fn test_discover_and_capture_over_loopback() {
        let (manager, reader) = manager_and_reader().await;
        let manager_id = manager.handle.local_peer_id();

        let role = reader
            .handle
            .request(manager_id, SubProtocol::Discover, b"discover".to_vec())
            .await
            .unwrap();
        assert_eq!(role, b"phonendo_manager");

        let capture = br#"{"value":"abc","timestamp":1000}"#.to_vec();
        let ack = reader
            .handle
            .request(manager_id, SubProtocol::Capture, capture.clone())
            .await
            .unwrap();
        assert_eq!(ack, b"true");
        let ack = reader
            .handle
            .request(manager_id, SubProtocol::Capture, capture)
            .await
            .unwrap();
        assert_eq!(ack, b"false");

        // The manager reaches the reader over the connection the reader opened
        let role = manager
            .handle
            .request(reader.handle.local_peer_id(), SubProtocol::Discover, b"discover".to_vec())
            .await
            .unwrap();
        assert_eq!(role, b"phonendo_reader");
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_replies() {
        let (manager, reader) = manager_and_reader().await;
        let manager_id = manager.handle.local_peer_id();

        let (role, ack, rtt) = tokio::join!(
            reader
                .handle
                .request(manager_id, SubProtocol::Discover, b"discover".to_vec()),
            reader.handle.request(
                manager_id,
                SubProtocol::Capture,
                br#"{"value":"xyz","timestamp":5}"#.to_vec()
            ),
            reader.handle.ping(manager_id),
        );

        assert_eq!(role.unwrap(), b"phonendo_manager");
        assert_eq!(ack.unwrap(), b"true");
        assert!(rtt.is_ok());
    }

    #[tokio::test]
    async fn test_ping_round_trips_every_call() {
        let (manager, reader) = manager_and_reader().await;
        let manager_id = manager.handle.local_peer_id();

        for _ in 0..3 {
            assert!(reader.handle.ping(manager_id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_ping_after_peer_stops_is_unreachable() {
        let (manager, reader) = manager_and_reader().await;
        let manager_id = manager.handle.local_peer_id();
        assert!(reader.handle.ping(manager_id).await.is_ok());

        manager.handle.shutdown().await;
        manager.task.await.unwrap();

        let err = reader.handle.ping(manager_id).await.unwrap_err();
        assert!(matches!(err, RelayError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_ping_unknown_peer_is_unreachable() {
        let reader = start_node(NodeRole::Reader, &[]).await;

        let err = reader.handle.ping(PeerId::random()).await.unwrap_err();
        assert!(matches!(err, RelayError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_mdns_discoveries_are_forwarded() {
        let config = loopback_config(NodeRole::Reader);
        let swarm = build_swarm(identity::Keypair::generate_ed25519(), &config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut driver, _handle) =
            SwarmDriver::new(swarm, Responder::new(NodeRole::Reader), Some(tx));

        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        driver.handle_mdns(mdns::Event::Discovered(vec![(peer, addr.clone()), (peer, addr)]));

        // Every sighting is forwarded; deduplication happens in the dispatcher
        assert_eq!(rx.try_recv().unwrap(), peer);
        assert_eq!(rx.try_recv().unwrap(), peer);
        assert!(rx.try_recv().is_err());
    }
}
