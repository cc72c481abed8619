//! p2pfs Core
//!
//! Content-addressed block storage, provider routing and block exchange for
//! the p2pfs node.

pub mod api;
pub mod blockexc;
pub mod commands;
pub mod config;
pub mod content_id;
pub mod dag;
pub mod datastore;
pub mod importer;
pub mod memory;
pub mod messages;
pub mod p2p;
pub mod routing;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use blockexc::{
    AnnounceTask, CandidateFailure, ExchangeConfig, ExchangeEngine, ExchangeError, FailureReason,
};
pub use commands::{execute, Cli, CommandError, Commands, COMMAND_TABLE};
pub use config::{Config, ConfigError};
pub use content_id::{block_cid, node_cid, parse_cid_str, verify_cid, CidError};
pub use dag::{list_links, DagLink, DagNode};
pub use datastore::{MemoryKv, PersistentKV, RocksKv};
pub use importer::{export_file, import_bytes, import_file, ImportError};
pub use memory::{MemoryNetwork, MemoryPeer};
pub use p2p::{create_swarm, Behaviour, Libp2pNode, P2PError};
pub use routing::{PeerDescriptor, PeerRouter, RoutingError};
pub use runtime::{run_node, Node, NodeError};
pub use storage::{Block, Blockstore, StorageError};
pub use transport::{ExchangeStream, Transport, TransportError, EXCHANGE_PROTOCOL};

// Re-export Cid for external use
pub use cid::Cid;
