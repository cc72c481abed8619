//! Whole-file import and export
//!
//! A file becomes exactly one raw block, however large it is. Export reads
//! from the local blockstore only; fetching from peers is the exchange
//! engine's job.

use cid::Cid;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::dag::{node_payload, DagError, DagNode};
use crate::storage::{Block, Blockstore, StorageError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dag(#[from] DagError),
}

impl ImportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ImportError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Store `data` as a single raw block
pub async fn import_bytes(data: Vec<u8>, store: &Blockstore) -> Result<Cid, ImportError> {
    let block = Block::new(data).map_err(StorageError::from)?;
    let cid = block.cid;
    store.put(block).await?;
    Ok(cid)
}

/// Read the file at `path` into one block, store it, and list it as shared
pub async fn import_file<P: AsRef<Path>>(path: P, store: &Blockstore) -> Result<Cid, ImportError> {
    let path = path.as_ref();
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| ImportError::io(path, e))?;
    let size = data.len();

    let cid = import_bytes(data, store).await?;

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        store.record_shared(name, &cid).await?;
    }

    info!("Imported {} ({} bytes) as {}", path.display(), size, cid);
    Ok(cid)
}

/// Store an already-built DAG node
pub async fn import_node(node: &DagNode, store: &Blockstore) -> Result<Cid, ImportError> {
    let block = node.to_block()?;
    let cid = block.cid;
    store.put(block).await?;
    Ok(cid)
}

/// File content stored under `cid`
pub async fn cat(cid: &Cid, store: &Blockstore) -> Result<Vec<u8>, ImportError> {
    let block = store.get(cid).await?;
    Ok(node_payload(&block)?)
}

/// Write the file content stored under `cid` to `path`
pub async fn export_file<P: AsRef<Path>>(
    cid: &Cid,
    store: &Blockstore,
    path: P,
) -> Result<(), ImportError> {
    let path = path.as_ref();
    let content = cat(cid, store).await?;

    tokio::fs::write(path, &content)
        .await
        .map_err(|e| ImportError::io(path, e))?;

    info!("Exported {} ({} bytes) to {}", cid, content.len(), path.display());
    Ok(())
}
