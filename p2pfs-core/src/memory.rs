//! In-process network
//!
//! [`MemoryNetwork`] is a hub that lets several nodes in one process find
//! and stream to each other without sockets. Each [`MemoryPeer`] implements
//! both [`Transport`] and [`PeerRouter`], so an exchange engine runs on it
//! unchanged. The hub's provider table stands in for the DHT.

use async_trait::async_trait;
use cid::Cid;
use futures::channel::mpsc;
use futures::stream::IntoAsyncRead;
use futures::{AsyncRead, AsyncWrite, StreamExt, TryStreamExt};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::debug;

use crate::routing::{PeerDescriptor, PeerRouter, RoutingError};
use crate::transport::{ExchangeStream, InboundStreams, Transport, TransportError};

type Chunk = io::Result<Vec<u8>>;
type Inbound = (PeerId, ExchangeStream);

/// One direction-pair of an in-memory byte pipe
pub struct MemoryStream {
    reader: IntoAsyncRead<mpsc::UnboundedReceiver<Chunk>>,
    writer: Option<mpsc::UnboundedSender<Chunk>>,
}

/// Two connected stream ends: bytes written to one are read from the other
pub fn pipe() -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::unbounded();
    let (b_tx, b_rx) = mpsc::unbounded();

    let a = MemoryStream {
        reader: b_rx.into_async_read(),
        writer: Some(a_tx),
    };
    let b = MemoryStream {
        reader: a_rx.into_async_read(),
        writer: Some(b_tx),
    };
    (a, b)
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = match &self.writer {
            Some(tx) => tx
                .unbounded_send(Ok(buf.to_vec()))
                .map(|_| buf.len())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        };
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the sender is the remote's end-of-stream
        self.writer.take();
        Poll::Ready(Ok(()))
    }
}

struct Slot {
    addr: Multiaddr,
    online: bool,
    inbound: mpsc::UnboundedSender<Inbound>,
    // Taken by the first accept()
    incoming: Option<mpsc::UnboundedReceiver<Inbound>>,
    /// Peers in the order they were first met
    address_book: Vec<PeerId>,
}

impl Slot {
    fn meet(&mut self, peer: PeerId) {
        if !self.address_book.contains(&peer) {
            self.address_book.push(peer);
        }
    }
}

#[derive(Default)]
struct Hub {
    peers: HashMap<PeerId, Slot>,
    providers: HashMap<Cid, Vec<PeerId>>,
    next_port: u64,
}

/// Shared registry of in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        // A panic while holding the hub lock leaves plain maps behind; keep going
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new peer with a random id
    pub fn add_peer(&self) -> MemoryPeer {
        let id = PeerId::random();
        let (tx, rx) = mpsc::unbounded();

        let mut hub = self.lock();
        hub.next_port += 1;
        let addr = Multiaddr::empty().with(Protocol::Memory(hub.next_port));
        hub.peers.insert(
            id,
            Slot {
                addr,
                online: true,
                inbound: tx,
                incoming: Some(rx),
                address_book: Vec::new(),
            },
        );

        MemoryPeer {
            id,
            network: self.clone(),
        }
    }

    /// Take a peer off (or back onto) the network. Offline peers can neither
    /// be dialed nor reach the provider table.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        if let Some(slot) = self.lock().peers.get_mut(peer) {
            slot.online = online;
        }
    }

    pub fn address_of(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.lock().peers.get(peer).map(|s| s.addr.clone())
    }

    fn is_online(&self, peer: &PeerId) -> bool {
        self.lock().peers.get(peer).is_some_and(|s| s.online)
    }
}

/// Handle for one peer on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryPeer {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryPeer {
    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        let addrs = self.network.address_of(&self.id).into_iter().collect();
        PeerDescriptor::with_addrs(self.id, addrs)
    }
}

#[async_trait]
impl Transport for MemoryPeer {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    async fn connect(&self, peer: &PeerDescriptor) -> Result<(), TransportError> {
        let mut hub = self.network.lock();

        let reachable = hub.peers.get(&peer.peer).is_some_and(|s| s.online)
            && hub.peers.get(&self.id).is_some_and(|s| s.online);
        if !reachable {
            return Err(TransportError::Dial {
                peer: peer.peer,
                reason: "peer unreachable".to_string(),
            });
        }

        // Connections are symmetric: both ends learn about each other
        if let Some(slot) = hub.peers.get_mut(&self.id) {
            slot.meet(peer.peer);
        }
        if let Some(slot) = hub.peers.get_mut(&peer.peer) {
            slot.meet(self.id);
        }
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId) -> Result<ExchangeStream, TransportError> {
        let hub = self.network.lock();
        let slot = hub
            .peers
            .get(peer)
            .filter(|s| s.online)
            .ok_or_else(|| TransportError::OpenStream {
                peer: *peer,
                reason: "peer unreachable".to_string(),
            })?;

        let (local, remote) = pipe();
        let remote: ExchangeStream = Box::new(remote);
        slot.inbound
            .unbounded_send((self.id, remote))
            .map_err(|_| TransportError::OpenStream {
                peer: *peer,
                reason: "peer is not accepting streams".to_string(),
            })?;

        debug!("Opened in-memory stream {} -> {}", self.id, peer);
        Ok(Box::new(local))
    }

    async fn known_peers(&self) -> Vec<PeerDescriptor> {
        let hub = self.network.lock();
        let Some(slot) = hub.peers.get(&self.id) else {
            return Vec::new();
        };

        slot.address_book
            .iter()
            .map(|peer| {
                let addrs = hub.peers.get(peer).map(|s| s.addr.clone()).into_iter().collect();
                PeerDescriptor::with_addrs(*peer, addrs)
            })
            .collect()
    }

    fn accept(&self) -> Result<InboundStreams, TransportError> {
        let mut hub = self.network.lock();
        let slot = hub.peers.get_mut(&self.id).ok_or(TransportError::Shutdown)?;
        let incoming = slot
            .incoming
            .take()
            .ok_or(TransportError::AlreadyAccepting)?;
        Ok(incoming.boxed())
    }
}

#[async_trait]
impl PeerRouter for MemoryPeer {
    async fn provide(&self, cid: &Cid, announce: bool) -> Result<(), RoutingError> {
        if announce && !self.network.is_online(&self.id) {
            return Err(RoutingError::Provide("node is offline".to_string()));
        }

        let mut hub = self.network.lock();
        let providers = hub.providers.entry(*cid).or_default();
        if !providers.contains(&self.id) {
            providers.push(self.id);
        }
        Ok(())
    }

    async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>, RoutingError> {
        if !self.network.is_online(&self.id) {
            return Err(RoutingError::Lookup("node is offline".to_string()));
        }

        let hub = self.network.lock();
        let found = hub
            .providers
            .get(cid)
            .map(|peers| {
                peers
                    .iter()
                    .take(limit)
                    .map(|peer| {
                        let addrs = hub.peers.get(peer).map(|s| s.addr.clone()).into_iter().collect();
                        PeerDescriptor::with_addrs(*peer, addrs)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }

    async fn bootstrap(&self) -> Result<(), RoutingError> {
        let hub = self.network.lock();
        if hub.peers.keys().any(|peer| *peer != self.id) {
            Ok(())
        } else {
            Err(RoutingError::NoKnownPeers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::block_cid;
    use futures::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_carries_bytes_and_eof() {
        let (mut a, mut b) = pipe();
        a.write_all(b"ping").await.unwrap();
        a.close().await.unwrap();

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // Writing after close fails
        assert!(a.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_stream_reaches_acceptor() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        let bob = net.add_peer();

        let mut incoming = bob.accept().unwrap();
        assert!(matches!(bob.accept(), Err(TransportError::AlreadyAccepting)));

        let mut out = alice.open_stream(&bob.peer_id()).await.unwrap();
        out.write_all(b"hi").await.unwrap();
        out.close().await.unwrap();

        let (from, mut stream) = incoming.next().await.unwrap();
        assert_eq!(from, alice.peer_id());
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_populates_both_address_books() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        let bob = net.add_peer();
        assert!(alice.known_peers().await.is_empty());

        alice.connect(&bob.descriptor()).await.unwrap();

        let known = alice.known_peers().await;
        assert_eq!(known.len(), 1);
        assert_eq!(known[0], bob.descriptor());
        assert_eq!(bob.known_peers().await[0].peer, alice.peer_id());
    }

    #[tokio::test]
    async fn test_known_peers_keep_first_met_order() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        let others: Vec<_> = (0..6).map(|_| net.add_peer()).collect();

        for peer in others.iter().rev() {
            alice.connect(&peer.descriptor()).await.unwrap();
        }
        // Reconnecting does not move a peer
        alice.connect(&others[5].descriptor()).await.unwrap();

        let known: Vec<_> = alice.known_peers().await.into_iter().map(|d| d.peer).collect();
        let expected: Vec<_> = others.iter().rev().map(|p| p.peer_id()).collect();
        assert_eq!(known, expected);
    }

    #[tokio::test]
    async fn test_offline_peer_unreachable() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        let bob = net.add_peer();
        net.set_online(&bob.peer_id(), false);

        assert!(matches!(
            alice.connect(&bob.descriptor()).await,
            Err(TransportError::Dial { .. })
        ));
        assert!(matches!(
            alice.open_stream(&bob.peer_id()).await,
            Err(TransportError::OpenStream { .. })
        ));
    }

    #[tokio::test]
    async fn test_provider_table() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        let bob = net.add_peer();
        let cid = block_cid(b"shared").unwrap();

        assert!(bob.find_providers(&cid, 10).await.unwrap().is_empty());

        alice.provide(&cid, true).await.unwrap();
        alice.provide(&cid, true).await.unwrap();

        let providers = bob.find_providers(&cid, 10).await.unwrap();
        assert_eq!(providers, vec![alice.descriptor()]);
        assert!(bob.find_providers(&cid, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_needs_other_peers() {
        let net = MemoryNetwork::new();
        let alice = net.add_peer();
        assert!(matches!(
            alice.bootstrap().await,
            Err(RoutingError::NoKnownPeers)
        ));

        let _bob = net.add_peer();
        alice.bootstrap().await.unwrap();
    }
}
