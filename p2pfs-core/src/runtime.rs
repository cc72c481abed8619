//! Node lifecycle
//!
//! Wires a blockstore, the libp2p node and the exchange engine together,
//! dials bootstrap peers, and runs the daemon until Ctrl+C.

use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::create_router;
use crate::blockexc::ExchangeEngine;
use crate::config::Config;
use crate::p2p::{load_or_generate_keypair, Libp2pNode, P2PError};
use crate::routing::{PeerDescriptor, PeerRouter};
use crate::storage::{Blockstore, StorageError};
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    P2P(#[from] P2PError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running network node serving blocks from its store
pub struct Node {
    engine: Arc<ExchangeEngine>,
    network: Arc<Libp2pNode>,
    driver: JoinHandle<()>,
    server: JoinHandle<()>,
}

impl Node {
    /// Start networking on `listen_port` (0 picks a free port) with the
    /// identity kept under the data directory.
    pub async fn start(config: &Config, store: Blockstore, listen_port: u16) -> Result<Self, NodeError> {
        let keypair = load_or_generate_keypair(&config.identity_path())?;
        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", listen_port)
            .parse()
            .map_err(|e| P2PError::Transport(format!("Invalid listen address: {}", e)))?;

        Self::launch(keypair, listen, store, config).await
    }

    /// Start networking with an explicit identity and listen address, then
    /// begin serving inbound block requests.
    pub async fn launch(
        keypair: Keypair,
        listen: Multiaddr,
        store: Blockstore,
        config: &Config,
    ) -> Result<Self, NodeError> {
        let (network, driver) = Libp2pNode::spawn(keypair, listen).await?;
        let network = Arc::new(network);

        let engine = Arc::new(ExchangeEngine::new(
            store,
            network.clone(),
            network.clone(),
            config.exchange_config(),
        ));
        let server = engine.serve(network.accept()?);

        if connect_bootstrap_nodes(&network, &config.bootstrap_nodes).await > 0 {
            if let Err(e) = network.bootstrap().await {
                warn!("DHT bootstrap failed: {}", e);
            }
        }

        info!("Node started with peer ID: {}", network.local_peer());
        Ok(Self {
            engine,
            network,
            driver,
            server,
        })
    }

    pub fn engine(&self) -> &Arc<ExchangeEngine> {
        &self.engine
    }

    pub fn network(&self) -> &Libp2pNode {
        &self.network
    }

    pub fn peer_id(&self) -> PeerId {
        self.network.local_peer()
    }

    /// Stop serving and wait for the swarm to wind down
    pub async fn shutdown(self) {
        self.network.shutdown().await;
        if let Err(e) = self.driver.await {
            warn!("P2P driver ended abnormally: {}", e);
        }
        self.server.abort();
        info!("Node stopped");
    }
}

/// Dial each `/…/p2p/<id>` address; returns how many connected
async fn connect_bootstrap_nodes(network: &Libp2pNode, nodes: &[String]) -> usize {
    let mut connected = 0;

    for node in nodes {
        let descriptor = match node.parse::<Multiaddr>() {
            Ok(addr) => PeerDescriptor::from_multiaddr(&addr),
            Err(e) => {
                warn!("Ignoring bootstrap node {}: {}", node, e);
                continue;
            }
        };
        let Some(descriptor) = descriptor else {
            warn!("Ignoring bootstrap node {}: missing /p2p/<peer id>", node);
            continue;
        };

        match network.connect(&descriptor).await {
            Ok(()) => {
                info!("Connected to bootstrap node {}", descriptor.peer);
                connected += 1;
            }
            Err(e) => warn!("Bootstrap node {} unreachable: {}", node, e),
        }
    }

    connected
}

/// Run the node with the given configuration until Ctrl+C
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let store = Blockstore::open(config.blocks_path())?;
    let node = Node::start(&config, store.clone(), config.listen_port).await?;

    // Shared files survive restarts; provider records do not
    for (name, cid) in store.shared_files().await? {
        info!("Re-announcing {} ({})", name, cid);
        node.engine().provide_block(cid);
    }

    let app = create_router(node.engine().clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    info!("REST API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await?;

    node.shutdown().await;
    store.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::import_bytes;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_node_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let first = Node::start(&config, Blockstore::in_memory(), 0).await.unwrap();
        let id = first.peer_id();
        first.shutdown().await;

        let second = Node::start(&config, Blockstore::in_memory(), 0).await.unwrap();
        assert_eq!(second.peer_id(), id);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_through_bootstrap_node() {
        let seed_dir = tempfile::tempdir().unwrap();
        let seed_store = Blockstore::in_memory();
        let cid = import_bytes(b"hello e2e".to_vec(), &seed_store).await.unwrap();
        let seed = Node::start(&test_config(seed_dir.path()), seed_store, 0)
            .await
            .unwrap();

        let addr = seed
            .network()
            .listen_addrs()
            .await
            .into_iter()
            .next()
            .unwrap()
            .with(libp2p::multiaddr::Protocol::P2p(seed.peer_id()));

        let leech_dir = tempfile::tempdir().unwrap();
        let mut leech_config = test_config(leech_dir.path());
        leech_config.bootstrap_nodes = vec![addr.to_string()];
        let leech = Node::start(&leech_config, Blockstore::in_memory(), 0)
            .await
            .unwrap();

        // Never announced: found through the bootstrap connection
        let block = leech.engine().get_block(&cid).await.unwrap();
        assert_eq!(block.data, b"hello e2e");

        leech.shutdown().await;
        seed.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_bootstrap_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.bootstrap_nodes = vec![
            "not a multiaddr".to_string(),
            "/ip4/127.0.0.1/tcp/1".to_string(),
        ];

        let node = Node::start(&config, Blockstore::in_memory(), 0).await.unwrap();
        node.shutdown().await;
    }
}
