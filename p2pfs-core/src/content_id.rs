//! Content identifiers for blocks
//!
//! Every block is named by a CIDv1 whose multihash is the SHA-256 digest of
//! the payload. Plain file payloads use the `raw` codec; payloads that encode
//! a DAG node with named links use `dag-pb`.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
pub const SHA256_CODE: u64 = 0x12;

/// Codec for opaque payload bytes
pub const RAW_CODEC: u64 = 0x55;

/// Codec for protobuf-encoded DAG nodes
pub const DAG_PB_CODEC: u64 = 0x70;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsupported hash function 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("Unsupported codec 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// SHA-256 digest of `data`
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// CIDv1 for `data` under the given codec
pub fn cid_for(codec: u64, data: &[u8]) -> Result<Cid, CidError> {
    if codec != RAW_CODEC && codec != DAG_PB_CODEC {
        return Err(CidError::UnsupportedCodec(codec));
    }

    let digest = sha256_digest(data);
    let mh = Multihash::wrap(SHA256_CODE, &digest)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;

    Ok(Cid::new_v1(codec, mh))
}

/// CID of a raw payload
pub fn block_cid(data: &[u8]) -> Result<Cid, CidError> {
    cid_for(RAW_CODEC, data)
}

/// CID of an encoded DAG node
pub fn node_cid(encoded: &[u8]) -> Result<Cid, CidError> {
    cid_for(DAG_PB_CODEC, encoded)
}

/// Check that `data` hashes to `expected`, using the codec `expected` carries
pub fn verify_cid(data: &[u8], expected: &Cid) -> Result<(), CidError> {
    let code = expected.hash().code();
    if code != SHA256_CODE {
        return Err(CidError::UnsupportedHash(code));
    }

    let computed = cid_for(expected.codec(), data)?;
    if computed.hash() != expected.hash() {
        return Err(CidError::HashMismatch {
            expected: expected.to_string(),
            actual: computed.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from its binary form
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Parse a CID from its textual form
pub fn parse_cid_str(s: &str) -> Result<Cid, CidError> {
    s.trim()
        .parse()
        .map_err(|e| CidError::InvalidCid(format!("{}: {}", s, e)))
}
