//! Provider routing
//!
//! A [`PeerRouter`] answers "who can serve this CID?" and announces that the
//! local node can. The libp2p backend drives a Kademlia DHT; the in-process
//! backend in [`crate::memory`] keeps a shared provider table.

use async_trait::async_trait;
use cid::Cid;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No known peers to bootstrap from")]
    NoKnownPeers,

    #[error("Provider announcement failed: {0}")]
    Provide(String),

    #[error("Provider lookup failed: {0}")]
    Lookup(String),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Routing backend stopped")]
    Shutdown,
}

/// A peer and the addresses it may be reached at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerDescriptor {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
        }
    }

    pub fn with_addrs(peer: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer, addrs }
    }

    /// Split `/ip4/.../tcp/.../p2p/<id>` into peer id and dialable address.
    ///
    /// Returns None when the address carries no `/p2p` component.
    pub fn from_multiaddr(addr: &Multiaddr) -> Option<Self> {
        let peer = addr.iter().find_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })?;

        let transport: Multiaddr = addr
            .iter()
            .filter(|p| !matches!(p, Protocol::P2p(_)))
            .collect();

        let addrs = if transport.is_empty() {
            Vec::new()
        } else {
            vec![transport]
        };
        Some(Self { peer, addrs })
    }
}

/// Content routing capability consumed by the exchange engine
#[async_trait]
pub trait PeerRouter: Send + Sync {
    /// Record the local node as a provider of `cid`. With `announce` the
    /// record is also pushed to the network.
    async fn provide(&self, cid: &Cid, announce: bool) -> Result<(), RoutingError>;

    /// Up to `limit` peers believed to hold `cid`. An empty list is not an error.
    async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
    ) -> Result<Vec<PeerDescriptor>, RoutingError>;

    async fn bootstrap(&self) -> Result<(), RoutingError>;
}
