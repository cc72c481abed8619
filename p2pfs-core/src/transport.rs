//! Stream transport capability
//!
//! The exchange engine needs three things from the network: dial a peer,
//! open a bidirectional byte stream to it on the exchange protocol, and
//! receive the streams other peers open to us.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use thiserror::Error;

use crate::routing::PeerDescriptor;

/// Protocol id negotiated for block request/response streams
pub const EXCHANGE_PROTOCOL: &str = "/p2pfs/bitswap/1.0.0";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to dial {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("Failed to open stream to {peer}: {reason}")]
    OpenStream { peer: PeerId, reason: String },

    #[error("Inbound streams are already being accepted")]
    AlreadyAccepting,

    #[error("Transport stopped")]
    Shutdown,
}

pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// One exchange stream. Closing (or dropping) it ends the exchange.
pub type ExchangeStream = Box<dyn StreamIo>;

/// Streams opened to us by remote peers
pub type InboundStreams = BoxStream<'static, (PeerId, ExchangeStream)>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Ensure a connection to `peer` exists, dialing its addresses if needed
    async fn connect(&self, peer: &PeerDescriptor) -> Result<(), TransportError>;

    async fn open_stream(&self, peer: &PeerId) -> Result<ExchangeStream, TransportError>;

    /// Peers in the address book: connected now or seen before
    async fn known_peers(&self) -> Vec<PeerDescriptor>;

    /// Take the inbound stream source. Only one consumer may do so.
    fn accept(&self) -> Result<InboundStreams, TransportError>;
}
