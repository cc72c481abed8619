//! P2P networking layer using rust-libp2p
//!
//! TCP transport with Noise encryption and Mplex multiplexing, carrying
//! Kademlia (provider records), Identify, Ping and raw exchange streams.
//!
//! The swarm lives on a single driver task. [`Libp2pNode`] is the cloneable
//! handle the rest of the crate talks to; it forwards routing and dial
//! requests to the driver over a channel and opens exchange streams through
//! the stream behaviour's control directly.

use async_trait::async_trait;
use cid::Cid;
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::kad::store::RecordStore;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, kad, noise, ping, tcp, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_mplex as mplex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::routing::{PeerDescriptor, PeerRouter, RoutingError};
use crate::transport::{ExchangeStream, InboundStreams, Transport, TransportError, EXCHANGE_PROTOCOL};

const IDENTIFY_PROTOCOL: &str = "/p2pfs/id/1.0.0";

/// Kademlia query budget; bounds how long an announcement can take
const KAD_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network behaviour: DHT, peer info, keep-alive and exchange streams
#[derive(libp2p::swarm::NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub stream: libp2p_stream::Behaviour,
}

#[derive(Debug)]
pub enum BehaviourEvent {
    Ping(ping::Event),
    Identify(Box<identify::Event>),
    Kademlia(kad::Event),
    Stream(()),
}

impl From<ping::Event> for BehaviourEvent {
    fn from(event: ping::Event) -> Self {
        BehaviourEvent::Ping(event)
    }
}

impl From<identify::Event> for BehaviourEvent {
    fn from(event: identify::Event) -> Self {
        BehaviourEvent::Identify(Box::new(event))
    }
}

impl From<kad::Event> for BehaviourEvent {
    fn from(event: kad::Event) -> Self {
        BehaviourEvent::Kademlia(event)
    }
}

impl From<()> for BehaviourEvent {
    fn from(_: ()) -> Self {
        BehaviourEvent::Stream(())
    }
}

/// Load the node identity from `path`, creating and saving a fresh ed25519
/// key if the file does not exist yet.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, P2PError> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| P2PError::Identity(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded identity from {:?}", path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| P2PError::Identity(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    info!("Generated new identity at {:?}", path);
    Ok(keypair)
}

/// Create a new P2P swarm for `keypair`
pub fn create_swarm(keypair: Keypair) -> Result<Swarm<Behaviour>, P2PError> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            mplex::MplexConfig::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
            kad_config.set_query_timeout(KAD_QUERY_TIMEOUT);
            let mut kademlia = kad::Behaviour::with_config(
                peer_id,
                kad::store::MemoryStore::new(peer_id),
                kad_config,
            );
            // Answer DHT queries even before we have confirmed external addresses
            kademlia.set_mode(Some(kad::Mode::Server));

            Behaviour {
                ping: ping::Behaviour::new(ping::Config::new()),
                identify: identify::Behaviour::new(
                    identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                        .with_agent_version(format!("p2pfs/{}", env!("CARGO_PKG_VERSION"))),
                ),
                kademlia,
                stream: libp2p_stream::Behaviour::new(),
            }
        })
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

fn provider_key(cid: &Cid) -> kad::RecordKey {
    kad::RecordKey::new(&cid.to_bytes())
}

enum Command {
    Dial {
        peer: PeerDescriptor,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Provide {
        cid: Cid,
        announce: bool,
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    FindProviders {
        cid: Cid,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<PeerDescriptor>, RoutingError>>,
    },
    Bootstrap {
        reply: oneshot::Sender<Result<(), RoutingError>>,
    },
    KnownPeers {
        reply: oneshot::Sender<Vec<PeerDescriptor>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown,
}

struct ProviderQuery {
    limit: usize,
    found: Vec<PeerId>,
    reply: oneshot::Sender<Result<Vec<PeerDescriptor>, RoutingError>>,
}

/// Owns the swarm; everything else reaches it through [`Command`]s
struct SwarmDriver {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    listen_addrs: Vec<Multiaddr>,
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
    /// Peers in the order they were first seen
    peer_order: Vec<PeerId>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), TransportError>>>>,
    pending_provides: HashMap<kad::QueryId, oneshot::Sender<Result<(), RoutingError>>>,
    pending_lookups: HashMap<kad::QueryId, ProviderQuery>,
    pending_bootstraps: HashMap<kad::QueryId, oneshot::Sender<Result<(), RoutingError>>>,
}

impl SwarmDriver {
    fn new(swarm: Swarm<Behaviour>, commands: mpsc::Receiver<Command>, listen_addrs: Vec<Multiaddr>) -> Self {
        Self {
            swarm,
            commands,
            listen_addrs,
            address_book: HashMap::new(),
            peer_order: Vec::new(),
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            pending_lookups: HashMap::new(),
            pending_bootstraps: HashMap::new(),
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        info!("P2P driver for {} stopped", self.swarm.local_peer_id());
    }

    fn addresses_mut(&mut self, peer: PeerId) -> &mut Vec<Multiaddr> {
        if !self.address_book.contains_key(&peer) {
            self.peer_order.push(peer);
        }
        self.address_book.entry(peer).or_default()
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        let addrs = self.addresses_mut(peer);
        if !addrs.contains(&addr) {
            addrs.push(addr.clone());
            self.swarm.behaviour_mut().kademlia.add_address(&peer, addr);
        }
    }

    fn descriptor(&self, peer: PeerId) -> PeerDescriptor {
        let addrs = self.address_book.get(&peer).cloned().unwrap_or_default();
        PeerDescriptor::with_addrs(peer, addrs)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, reply } => self.dial(peer, reply),
            Command::Provide {
                cid,
                announce,
                reply,
            } => self.provide(cid, announce, reply),
            Command::FindProviders { cid, limit, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(provider_key(&cid));
                self.pending_lookups.insert(
                    id,
                    ProviderQuery {
                        limit,
                        found: Vec::new(),
                        reply,
                    },
                );
            }
            Command::Bootstrap { reply } => match self.swarm.behaviour_mut().kademlia.bootstrap() {
                Ok(id) => {
                    self.pending_bootstraps.insert(id, reply);
                }
                Err(_) => {
                    let _ = reply.send(Err(RoutingError::NoKnownPeers));
                }
            },
            Command::KnownPeers { reply } => {
                let peers = self.peer_order.iter().map(|p| self.descriptor(*p)).collect();
                let _ = reply.send(peers);
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, peer: PeerDescriptor, reply: oneshot::Sender<Result<(), TransportError>>) {
        let target = peer.peer;
        if target == *self.swarm.local_peer_id() || self.swarm.is_connected(&target) {
            let _ = reply.send(Ok(()));
            return;
        }

        for addr in peer.addrs {
            self.remember(target, addr);
        }

        if let Some(waiting) = self.pending_dials.get_mut(&target) {
            waiting.push(reply);
            return;
        }

        let addrs = self.address_book.get(&target).cloned().unwrap_or_default();
        let opts = if addrs.is_empty() {
            DialOpts::peer_id(target).build()
        } else {
            DialOpts::peer_id(target)
                .addresses(addrs)
                .extend_addresses_through_behaviour()
                .build()
        };

        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(target, vec![reply]);
            }
            Err(e) => {
                let _ = reply.send(Err(TransportError::Dial {
                    peer: target,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn provide(&mut self, cid: Cid, announce: bool, reply: oneshot::Sender<Result<(), RoutingError>>) {
        let key = provider_key(&cid);

        if announce {
            match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                Ok(id) => {
                    self.pending_provides.insert(id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(RoutingError::Provide(e.to_string())));
                }
            }
            return;
        }

        let local = *self.swarm.local_peer_id();
        let record = kad::ProviderRecord::new(key, local, self.listen_addrs.clone());
        let result = self
            .swarm
            .behaviour_mut()
            .kademlia
            .store_mut()
            .add_provider(record)
            .map_err(|e| RoutingError::Provide(e.to_string()));
        let _ = reply.send(result);
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!("Connection established with {}", peer_id);
                if endpoint.is_dialer() {
                    self.remember(peer_id, endpoint.get_remote_address().clone());
                } else {
                    self.addresses_mut(peer_id);
                }

                if let Some(waiting) = self.pending_dials.remove(&peer_id) {
                    for reply in waiting {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                warn!("Failed to connect to {}: {}", peer_id, error);
                if let Some(waiting) = self.pending_dials.remove(&peer_id) {
                    for reply in waiting {
                        let _ = reply.send(Err(TransportError::Dial {
                            peer: peer_id,
                            reason: error.to_string(),
                        }));
                    }
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection closed with {}: {:?}", peer_id, cause);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => {
                if let identify::Event::Received { peer_id, info, .. } = *event {
                    debug!("Identified {} ({})", peer_id, info.agent_version);
                    for addr in info.listen_addrs {
                        self.remember(peer_id, addr);
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(BehaviourEvent::Ping(event)) => {
                if let Err(e) = event.result {
                    debug!("Ping to {} failed: {}", event.peer, e);
                }
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => self.handle_query_result(id, result, step),
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!("Routing table updated with {}", peer);
            }
            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: kad::QueryId, result: kad::QueryResult, step: kad::ProgressStep) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_provides.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| RoutingError::Provide(e.to_string())));
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders { providers, .. })) => {
                let Some(query) = self.pending_lookups.get_mut(&id) else {
                    return;
                };
                for peer in providers {
                    if !query.found.contains(&peer) {
                        query.found.push(peer);
                    }
                }

                if query.found.len() >= query.limit || step.last {
                    if let Some(mut running) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        running.finish();
                    }
                    self.finish_lookup(id);
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            })) => self.finish_lookup(id),
            kad::QueryResult::GetProviders(Err(e)) => {
                debug!("Provider lookup ended early: {}", e);
                self.finish_lookup(id);
            }
            kad::QueryResult::Bootstrap(result) => {
                if !step.last {
                    return;
                }
                if let Some(reply) = self.pending_bootstraps.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| RoutingError::Bootstrap(e.to_string())));
                }
            }
            _ => {}
        }
    }

    fn finish_lookup(&mut self, id: kad::QueryId) {
        if let Some(query) = self.pending_lookups.remove(&id) {
            let mut unique = HashSet::new();
            let found = query
                .found
                .into_iter()
                .filter(|p| unique.insert(*p))
                .take(query.limit)
                .map(|p| self.descriptor(p))
                .collect();
            let _ = query.reply.send(Ok(found));
        }
    }
}

/// Handle to a running libp2p node
#[derive(Clone)]
pub struct Libp2pNode {
    local_peer: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
}

impl Libp2pNode {
    /// Build the swarm, start listening on `listen` and spawn the driver.
    ///
    /// Returns once at least one listen address is bound.
    pub async fn spawn(keypair: Keypair, listen: Multiaddr) -> Result<(Self, JoinHandle<()>), P2PError> {
        let mut swarm = create_swarm(keypair)?;
        let local_peer = *swarm.local_peer_id();
        let control = swarm.behaviour().stream.new_control();

        swarm
            .listen_on(listen)
            .map_err(|e| P2PError::Transport(e.to_string()))?;
        let first = wait_for_listen_addr(&mut swarm).await?;

        info!("Local peer ID: {}", local_peer);
        info!("Listening on {}", first);

        let (tx, rx) = mpsc::channel(64);
        let driver = tokio::spawn(SwarmDriver::new(swarm, rx, vec![first]).run());

        Ok((
            Self {
                local_peer,
                commands: tx,
                control,
            },
            driver,
        ))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.request(|reply| Command::ListenAddrs { reply })
            .await
            .unwrap_or_default()
    }

    /// This node as others should dial it
    pub async fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::with_addrs(self.local_peer, self.listen_addrs().await)
    }

    /// Stop the driver. Open streams and connections are dropped.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

async fn wait_for_listen_addr(swarm: &mut Swarm<Behaviour>) -> Result<Multiaddr, P2PError> {
    let wait = async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
                SwarmEvent::ListenerClosed { reason: Err(e), .. } => {
                    return Err(P2PError::Transport(e.to_string()))
                }
                other => debug!("Event before listen address: {:?}", other),
            }
        }
    };

    tokio::time::timeout(LISTEN_TIMEOUT, wait)
        .await
        .map_err(|_| P2PError::Transport("timed out waiting for a listen address".to_string()))?
}

#[async_trait]
impl Transport for Libp2pNode {
    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    async fn connect(&self, peer: &PeerDescriptor) -> Result<(), TransportError> {
        self.request(|reply| Command::Dial {
            peer: peer.clone(),
            reply,
        })
        .await
        .unwrap_or(Err(TransportError::Shutdown))
    }

    async fn open_stream(&self, peer: &PeerId) -> Result<ExchangeStream, TransportError> {
        let stream = self
            .control
            .clone()
            .open_stream(*peer, StreamProtocol::new(EXCHANGE_PROTOCOL))
            .await
            .map_err(|e| TransportError::OpenStream {
                peer: *peer,
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    async fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.request(|reply| Command::KnownPeers { reply })
            .await
            .unwrap_or_default()
    }

    fn accept(&self) -> Result<InboundStreams, TransportError> {
        let incoming = self
            .control
            .clone()
            .accept(StreamProtocol::new(EXCHANGE_PROTOCOL))
            .map_err(|_| TransportError::AlreadyAccepting)?;

        Ok(incoming
            .map(|(peer, stream)| {
                let stream: ExchangeStream = Box::new(stream);
                (peer, stream)
            })
            .boxed())
    }
}

#[async_trait]
impl PeerRouter for Libp2pNode {
    async fn provide(&self, cid: &Cid, announce: bool) -> Result<(), RoutingError> {
        self.request(|reply| Command::Provide {
            cid: *cid,
            announce,
            reply,
        })
        .await
        .unwrap_or(Err(RoutingError::Shutdown))
    }

    async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>, RoutingError> {
        self.request(|reply| Command::FindProviders {
            cid: *cid,
            limit,
            reply,
        })
        .await
        .unwrap_or(Err(RoutingError::Shutdown))
    }

    async fn bootstrap(&self) -> Result<(), RoutingError> {
        self.request(|reply| Command::Bootstrap { reply })
            .await
            .unwrap_or(Err(RoutingError::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::block_cid;

    fn localhost() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_swarm() {
        let swarm = create_swarm(Keypair::generate_ed25519()).unwrap();
        assert!(!swarm.local_peer_id().to_string().is_empty());
    }

    #[tokio::test]
    async fn test_swarm_can_listen() {
        let mut swarm = create_swarm(Keypair::generate_ed25519()).unwrap();
        assert!(swarm.listen_on(localhost()).is_ok());
    }

    #[test]
    fn test_identity_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = load_or_generate_keypair(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_keypair(&path).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn test_corrupt_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"garbage").unwrap();

        assert!(matches!(
            load_or_generate_keypair(&path),
            Err(P2PError::Identity(_))
        ));
    }

    #[tokio::test]
    async fn test_node_reports_listen_addr() {
        let (node, _driver) = Libp2pNode::spawn(Keypair::generate_ed25519(), localhost())
            .await
            .unwrap();
        let desc = node.descriptor().await;
        assert_eq!(desc.peer, node.local_peer());
        assert!(!desc.addrs.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_and_find_provider() {
        let (alice, _a) = Libp2pNode::spawn(Keypair::generate_ed25519(), localhost())
            .await
            .unwrap();
        let (bob, _b) = Libp2pNode::spawn(Keypair::generate_ed25519(), localhost())
            .await
            .unwrap();

        bob.connect(&alice.descriptor().await).await.unwrap();
        assert!(bob
            .known_peers()
            .await
            .iter()
            .any(|p| p.peer == alice.local_peer()));

        let cid = block_cid(b"kad provider").unwrap();
        // Announcement is best-effort; the local record exists either way
        let _ = alice.provide(&cid, true).await;

        let providers = bob.find_providers(&cid, 10).await.unwrap();
        assert!(providers.iter().any(|p| p.peer == alice.local_peer()));

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_without_peers() {
        let (node, _driver) = Libp2pNode::spawn(Keypair::generate_ed25519(), localhost())
            .await
            .unwrap();
        assert!(matches!(
            node.bootstrap().await,
            Err(RoutingError::NoKnownPeers)
        ));
        node.shutdown().await;
    }
}
