//! DAG nodes: blocks that name their children
//!
//! A node carries an opaque data section plus a list of named links to child
//! CIDs, protobuf-encoded in the dag-pb field layout. A node's CID is derived
//! from its encoded bytes, so a node can only link to blocks that already
//! exist and the link graph is acyclic.

use cid::Cid;
use prost::Message as ProstMessage;
use thiserror::Error;
use tracing::debug;

use crate::content_id::{node_cid, parse_cid, CidError, DAG_PB_CODEC, RAW_CODEC};
use crate::storage::Block;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid link {name:?}: {source}")]
    InvalidLink { name: String, source: CidError },

    #[error("CID error: {0}")]
    Cid(#[from] CidError),

    #[error("Unsupported codec 0x{0:x}")]
    UnsupportedCodec(u64),
}

#[derive(Clone, PartialEq, prost::Message)]
struct PbLink {
    #[prost(bytes = "vec", tag = "1")]
    hash: Vec<u8>,

    #[prost(string, tag = "2")]
    name: String,

    #[prost(uint64, tag = "3")]
    tsize: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct PbNode {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,

    #[prost(message, repeated, tag = "2")]
    links: Vec<PbLink>,
}

/// Named reference from a node to a child block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagLink {
    pub name: String,
    pub cid: Cid,
    /// Size hint of the linked block, 0 if unknown
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DagNode {
    pub data: Vec<u8>,
    pub links: Vec<DagLink>,
}

impl DagNode {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, name: impl Into<String>, cid: Cid, size: u64) -> Self {
        self.links.push(DagLink {
            name: name.into(),
            cid,
            size,
        });
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let pb = PbNode {
            data: self.data.clone(),
            links: self
                .links
                .iter()
                .map(|link| PbLink {
                    hash: link.cid.to_bytes(),
                    name: link.name.clone(),
                    tsize: link.size,
                })
                .collect(),
        };
        pb.encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DagError> {
        let pb = PbNode::decode(bytes)?;

        let links = pb
            .links
            .into_iter()
            .map(|link| {
                let cid = parse_cid(&link.hash).map_err(|source| DagError::InvalidLink {
                    name: link.name.clone(),
                    source,
                })?;
                Ok(DagLink {
                    name: link.name,
                    cid,
                    size: link.tsize,
                })
            })
            .collect::<Result<Vec<_>, DagError>>()?;

        Ok(Self {
            data: pb.data,
            links,
        })
    }

    pub fn cid(&self) -> Result<Cid, DagError> {
        Ok(node_cid(&self.encode())?)
    }

    /// Encode into a dag-pb block
    pub fn to_block(&self) -> Result<Block, DagError> {
        let data = self.encode();
        let cid = node_cid(&data)?;
        Ok(Block { cid, data })
    }
}

/// Links carried by `block`.
///
/// Raw blocks, and dag-pb blocks that fail to decode, have no links.
pub fn list_links(block: &Block) -> Vec<DagLink> {
    if block.cid.codec() != DAG_PB_CODEC {
        return Vec::new();
    }

    match DagNode::decode(&block.data) {
        Ok(node) => node.links,
        Err(e) => {
            debug!("Block {} is not a decodable DAG node: {}", block.cid, e);
            Vec::new()
        }
    }
}

/// File content of `block`: the payload itself for raw blocks, the node's
/// data section for DAG nodes (links are ignored).
pub fn node_payload(block: &Block) -> Result<Vec<u8>, DagError> {
    match block.cid.codec() {
        RAW_CODEC => Ok(block.data.clone()),
        DAG_PB_CODEC => Ok(DagNode::decode(&block.data)?.data),
        other => Err(DagError::UnsupportedCodec(other)),
    }
}
