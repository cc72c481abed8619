//! Block exchange engine
//!
//! Resolves a CID to a block: local store first, then providers found via
//! the router, then any peer already in the transport's address book.
//! Candidates are tried one at a time with a single request/response
//! stream each, and every failure is kept so a miss can report why.
//!
//! The same engine serves inbound requests from the local store.

use cid::Cid;
use futures::{AsyncWriteExt, StreamExt};
use libp2p::PeerId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::content_id::parse_cid_str;
use crate::messages::{read_message, write_message, BlockRequest, BlockResponse, MessageError};
use crate::routing::{PeerDescriptor, PeerRouter};
use crate::storage::{Block, Blockstore, StorageError};
use crate::transport::{ExchangeStream, InboundStreams, Transport};

/// Providers asked for per lookup
pub const DEFAULT_PROVIDER_LIMIT: usize = 10;

/// Budget for one candidate: dial, request and response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for a whole lookup across all candidates
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    pub provider_limit: usize,
    pub request_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            provider_limit: DEFAULT_PROVIDER_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Why one candidate could not deliver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    Connect(String),
    OpenStream(String),
    Io(String),
    Decode(String),
    /// The peer answered with an error, usually "block not found"
    Remote(String),
    /// The payload did not hash to the requested CID
    Integrity(String),
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Connect(e) => write!(f, "connect: {}", e),
            FailureReason::OpenStream(e) => write!(f, "open stream: {}", e),
            FailureReason::Io(e) => write!(f, "io: {}", e),
            FailureReason::Decode(e) => write!(f, "decode: {}", e),
            FailureReason::Remote(e) => write!(f, "remote: {}", e),
            FailureReason::Integrity(e) => write!(f, "integrity: {}", e),
            FailureReason::Timeout => write!(f, "timed out"),
        }
    }
}

impl From<MessageError> for FailureReason {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::Io(e) => FailureReason::Io(e.to_string()),
            other => FailureReason::Decode(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateFailure {
    pub peer: PeerId,
    pub reason: FailureReason,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Block {cid} not found ({} candidates tried)", .attempts.len())]
    NotFound {
        cid: Cid,
        attempts: Vec<CandidateFailure>,
    },

    #[error("Deadline exceeded fetching {cid} ({} candidates tried)", .attempts.len())]
    DeadlineExceeded {
        cid: Cid,
        attempts: Vec<CandidateFailure>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ExchangeError {
    /// Per-candidate failures behind a miss; empty for other errors
    pub fn attempts(&self) -> &[CandidateFailure] {
        match self {
            ExchangeError::NotFound { attempts, .. }
            | ExchangeError::DeadlineExceeded { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// Background provider announcement. Await it to know it finished; dropping
/// it leaves the announcement running.
pub type AnnounceTask = JoinHandle<()>;

pub struct ExchangeEngine {
    store: Blockstore,
    router: Arc<dyn PeerRouter>,
    transport: Arc<dyn Transport>,
    config: ExchangeConfig,
}

impl ExchangeEngine {
    pub fn new(
        store: Blockstore,
        router: Arc<dyn PeerRouter>,
        transport: Arc<dyn Transport>,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            store,
            router,
            transport,
            config,
        }
    }

    pub fn store(&self) -> &Blockstore {
        &self.store
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Resolve `cid` within the configured fetch timeout
    pub async fn get_block(&self, cid: &Cid) -> Result<Block, ExchangeError> {
        let deadline = Instant::now() + self.config.fetch_timeout;
        self.get_block_until(cid, deadline).await
    }

    /// Resolve `cid`, giving up on remaining candidates at `deadline`.
    ///
    /// A block fetched from a peer is verified and stored before returning.
    /// Storage failures abort the lookup; per-candidate failures do not.
    pub async fn get_block_until(&self, cid: &Cid, deadline: Instant) -> Result<Block, ExchangeError> {
        match self.store.get(cid).await {
            Ok(block) => {
                debug!("BlockExc: {} served from local store", cid);
                return Ok(block);
            }
            Err(StorageError::BlockNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let candidates = match timeout_at(deadline, self.candidates(cid)).await {
            Ok(candidates) => candidates,
            Err(_) => {
                warn!("BlockExc: Deadline reached looking up providers for {}", cid);
                return Err(ExchangeError::DeadlineExceeded {
                    cid: *cid,
                    attempts: Vec::new(),
                });
            }
        };
        debug!("BlockExc: {} candidate(s) for {}", candidates.len(), cid);

        let mut attempts = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let now = Instant::now();
            if now >= deadline {
                warn!("BlockExc: Deadline reached fetching {}", cid);
                return Err(ExchangeError::DeadlineExceeded {
                    cid: *cid,
                    attempts,
                });
            }

            let attempt_deadline = deadline.min(now + self.config.request_timeout);
            let outcome = match timeout_at(attempt_deadline, self.fetch_from(&candidate, cid)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FailureReason::Timeout),
            };

            match outcome {
                Ok(block) => {
                    self.store.put(block.clone()).await?;
                    info!(
                        "BlockExc: Fetched {} ({} bytes) from {}",
                        cid,
                        block.size(),
                        candidate.peer
                    );
                    return Ok(block);
                }
                Err(reason) => {
                    debug!("BlockExc: {} could not serve {}: {}", candidate.peer, cid, reason);
                    attempts.push(CandidateFailure {
                        peer: candidate.peer,
                        reason,
                    });
                }
            }
        }

        Err(ExchangeError::NotFound {
            cid: *cid,
            attempts,
        })
    }

    /// Providers of `cid`, or every known peer when the router has none.
    /// The local peer is never a candidate.
    async fn candidates(&self, cid: &Cid) -> Vec<PeerDescriptor> {
        let local = self.transport.local_peer();

        let providers = match self
            .router
            .find_providers(cid, self.config.provider_limit)
            .await
        {
            Ok(providers) => providers,
            Err(e) => {
                warn!("BlockExc: Provider lookup for {} failed: {}", cid, e);
                Vec::new()
            }
        };

        let mut candidates = dedup_remote(providers, local);
        if candidates.is_empty() {
            candidates = dedup_remote(self.transport.known_peers().await, local);
            debug!(
                "BlockExc: No providers for {}, falling back to {} known peer(s)",
                cid,
                candidates.len()
            );
        }
        candidates
    }

    async fn fetch_from(&self, candidate: &PeerDescriptor, cid: &Cid) -> Result<Block, FailureReason> {
        self.transport
            .connect(candidate)
            .await
            .map_err(|e| FailureReason::Connect(e.to_string()))?;

        let mut stream = self
            .transport
            .open_stream(&candidate.peer)
            .await
            .map_err(|e| FailureReason::OpenStream(e.to_string()))?;

        let result = request_block(&mut stream, cid).await;
        if let Err(e) = stream.close().await {
            debug!("BlockExc: Closing stream to {} failed: {}", candidate.peer, e);
        }

        let data = result?;
        Block::from_cid_and_data(*cid, data).map_err(|e| FailureReason::Integrity(e.to_string()))
    }

    /// Announce the local node as a provider of `cid` in the background.
    ///
    /// Announcement failures are logged, never returned.
    pub fn provide_block(&self, cid: Cid) -> AnnounceTask {
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            match router.provide(&cid, true).await {
                Ok(()) => info!("BlockExc: Announced provider record for {}", cid),
                Err(e) => warn!("BlockExc: Provider announcement for {} failed: {}", cid, e),
            }
        })
    }

    /// Serve every inbound stream, each on its own task
    pub fn serve(self: &Arc<Self>, mut incoming: InboundStreams) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.handle_inbound(peer, stream).await;
                });
            }
            debug!("BlockExc: Inbound stream source closed");
        })
    }

    /// Answer one request on `stream`.
    ///
    /// Malformed requests get no reply; the stream is just closed.
    pub async fn handle_inbound(&self, peer: PeerId, mut stream: ExchangeStream) {
        let request: BlockRequest =
            match timeout(self.config.request_timeout, read_message(&mut stream)).await {
                Ok(Ok(request)) => request,
                Ok(Err(e)) => {
                    debug!("BlockExc: Dropping malformed request from {}: {}", peer, e);
                    let _ = stream.close().await;
                    return;
                }
                Err(_) => {
                    debug!("BlockExc: Request from {} timed out", peer);
                    let _ = stream.close().await;
                    return;
                }
            };

        let cid = match parse_cid_str(&request.cid) {
            Ok(cid) => cid,
            Err(e) => {
                debug!("BlockExc: Dropping request from {}: {}", peer, e);
                let _ = stream.close().await;
                return;
            }
        };

        let response = self.respond(&cid).await;
        if response.is_error() {
            debug!("BlockExc: Cannot serve {} to {}: {}", cid, peer, response.err);
        } else {
            info!("BlockExc: Serving {} ({} bytes) to {}", cid, response.data.len(), peer);
        }

        if let Err(e) = write_message(&mut stream, &response).await {
            warn!("BlockExc: Failed to send response to {}: {}", peer, e);
        }
        let _ = stream.close().await;
    }

    async fn respond(&self, cid: &Cid) -> BlockResponse {
        match self.store.get(cid).await {
            Ok(block) => BlockResponse::found(block.data),
            Err(e) => BlockResponse::error(e.to_string()),
        }
    }
}

fn dedup_remote(peers: Vec<PeerDescriptor>, local: PeerId) -> Vec<PeerDescriptor> {
    let mut seen = HashSet::new();
    peers
        .into_iter()
        .filter(|p| p.peer != local && seen.insert(p.peer))
        .collect()
}

async fn request_block(stream: &mut ExchangeStream, cid: &Cid) -> Result<Vec<u8>, FailureReason> {
    write_message(stream, &BlockRequest::new(cid)).await?;
    let response: BlockResponse = read_message(stream).await?;

    if response.is_error() {
        return Err(FailureReason::Remote(response.err));
    }
    Ok(response.data)
}
