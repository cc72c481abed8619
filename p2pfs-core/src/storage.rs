//! Content-addressed block storage
//!
//! Blocks are persisted through a [`PersistentKV`] backend, keyed by the
//! binary form of their CID. Every block is verified against its CID before
//! it is written, so anything read back satisfies `hash(data) == cid`.

use cid::Cid;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::content_id::{block_cid, verify_cid, CidError};
use crate::datastore::{MemoryKv, PersistentKV, RocksKv, BLOCKS_BUCKET, META_BUCKET};

/// Label of the name → CID listing in the meta partition
const SHARED_FILES_KEY: &[u8] = b"shared-files";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("CID verification failed: {0}")]
    Verification(#[from] CidError),

    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("Datastore is closed")]
    Closed,

    #[error("Datastore error: {0}")]
    Backend(String),

    #[error("Corrupt metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a raw block from data, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, CidError> {
        let cid = block_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_cid(&data, &cid)?;
        Ok(Self { cid, data })
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// CID-indexed block storage over a pluggable key-value backend.
///
/// Cloning is cheap; clones share the backend.
#[derive(Clone)]
pub struct Blockstore {
    kv: Arc<dyn PersistentKV>,
    // Serialises read-modify-write of the shared files listing
    meta_lock: Arc<Mutex<()>>,
}

impl Blockstore {
    pub fn new(kv: Arc<dyn PersistentKV>) -> Self {
        Self {
            kv,
            meta_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open (or create) a RocksDB-backed store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(RocksKv::open(path)?)))
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn PersistentKV) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let kv = Arc::clone(&self.kv);
        tokio::task::spawn_blocking(move || op(kv.as_ref()))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Store a block, verifying its CID. Overwrites any existing entry.
    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_cid(&block.data, &block.cid)?;

        let cid = block.cid;
        let size = block.size();
        let key = cid.to_bytes();

        self.run_blocking(move |kv| kv.put(BLOCKS_BUCKET, &key, &block.data))
            .await?;

        debug!("Stored block {}, size: {} bytes", cid, size);
        Ok(())
    }

    /// Store raw data as a raw-codec block
    pub async fn put_data(&self, data: Vec<u8>) -> Result<Cid, StorageError> {
        let block = Block::new(data)?;
        let cid = block.cid;
        self.put(block).await?;
        Ok(cid)
    }

    /// Retrieve a block by CID
    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let key = cid.to_bytes();
        let data = self
            .run_blocking(move |kv| kv.get(BLOCKS_BUCKET, &key))
            .await?
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))?;

        Ok(Block { cid: *cid, data })
    }

    /// Check if a block exists without reading its payload
    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let key = cid.to_bytes();
        self.run_blocking(move |kv| kv.contains(BLOCKS_BUCKET, &key))
            .await
    }

    /// Delete a block. Deleting an absent block succeeds.
    pub async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        let key = cid.to_bytes();
        self.run_blocking(move |kv| kv.delete(BLOCKS_BUCKET, &key))
            .await?;

        debug!("Deleted block {}", cid);
        Ok(())
    }

    /// Release the backend. Must run before process exit.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.run_blocking(|kv| kv.close()).await?;
        info!("Blockstore closed");
        Ok(())
    }

    /// Remember `name` as a shared file resolving to `cid`
    pub async fn record_shared(&self, name: &str, cid: &Cid) -> Result<(), StorageError> {
        let _guard = self.meta_lock.lock().await;

        let mut files = self.load_shared().await?;
        files.insert(name.to_string(), cid.to_string());
        let encoded = serde_json::to_vec(&files)?;

        self.run_blocking(move |kv| kv.put(META_BUCKET, SHARED_FILES_KEY, &encoded))
            .await
    }

    /// Shared files listing, ordered by name
    pub async fn shared_files(&self) -> Result<BTreeMap<String, Cid>, StorageError> {
        let _guard = self.meta_lock.lock().await;

        self.load_shared()
            .await?
            .into_iter()
            .map(|(name, cid)| {
                let cid = cid
                    .parse::<Cid>()
                    .map_err(|e| StorageError::Backend(format!("bad CID for {}: {}", name, e)))?;
                Ok((name, cid))
            })
            .collect()
    }

    async fn load_shared(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let raw = self
            .run_blocking(|kv| kv.get(META_BUCKET, SHARED_FILES_KEY))
            .await?;

        match raw {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_new() {
        let data = b"hello world".to_vec();
        let block = Block::new(data.clone()).unwrap();

        assert_eq!(block.data, data);
        assert_eq!(block.size(), data.len());
    }

    #[tokio::test]
    async fn test_block_from_cid_and_data() {
        let data = b"hello world".to_vec();
        let block1 = Block::new(data.clone()).unwrap();

        let block2 = Block::from_cid_and_data(block1.cid, data).unwrap();
        assert_eq!(block1, block2);

        let result = Block::from_cid_and_data(block1.cid, b"goodbye world".to_vec());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_store_put_get() {
        let store = Blockstore::in_memory();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        store.put(block.clone()).await.unwrap();

        let retrieved = store.get(&cid).await.unwrap();
        assert_eq!(retrieved, block);
    }

    #[tokio::test]
    async fn test_store_put_data() {
        let store = Blockstore::in_memory();
        let data = b"hello world".to_vec();

        let cid = store.put_data(data.clone()).await.unwrap();

        let block = store.get(&cid).await.unwrap();
        assert_eq!(block.data, data);
    }

    #[tokio::test]
    async fn test_store_rejects_mismatched_block() {
        let store = Blockstore::in_memory();
        let honest = Block::new(b"honest".to_vec()).unwrap();
        let forged = Block {
            cid: honest.cid,
            data: b"forged".to_vec(),
        };

        let result = store.put(forged).await;
        assert!(matches!(result, Err(StorageError::Verification(_))));
        assert!(!store.has(&honest.cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_get_missing() {
        let store = Blockstore::in_memory();
        let cid = block_cid(b"never stored").unwrap();

        match store.get(&cid).await {
            Err(StorageError::BlockNotFound(s)) => assert_eq!(s, cid.to_string()),
            other => panic!("Expected BlockNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_has() {
        let store = Blockstore::in_memory();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        assert!(!store.has(&cid).await.unwrap());
        store.put(block).await.unwrap();
        assert!(store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_delete() {
        let store = Blockstore::in_memory();
        let block = Block::new(b"hello world".to_vec()).unwrap();
        let cid = block.cid;

        store.put(block).await.unwrap();
        assert!(store.has(&cid).await.unwrap());

        store.delete(&cid).await.unwrap();
        assert!(!store.has(&cid).await.unwrap());
        assert!(store.get(&cid).await.is_err());

        // Deleting again, or deleting something never stored, is fine
        store.delete(&cid).await.unwrap();
        store
            .delete(&block_cid(b"never stored").unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_idempotent_put() {
        let store = Blockstore::in_memory();
        let block = Block::new(b"hello world".to_vec()).unwrap();

        store.put(block.clone()).await.unwrap();
        store.put(block.clone()).await.unwrap();

        assert_eq!(store.get(&block.cid).await.unwrap(), block);
    }

    #[tokio::test]
    async fn test_round_trip_various_payloads() {
        let store = Blockstore::in_memory();
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![0u8],
            b"hello e2e".to_vec(),
            (0..=255u8).collect(),
            vec![0x42u8; 1024 * 1024],
        ];

        for payload in payloads {
            let cid = store.put_data(payload.clone()).await.unwrap();
            assert_eq!(cid, block_cid(&payload).unwrap());
            assert_eq!(store.get(&cid).await.unwrap().data, payload);
        }
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let store = Blockstore::in_memory();

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let data = format!("block {}", i).into_bytes();
                let cid = store.put_data(data.clone()).await.unwrap();
                assert_eq!(store.get(&cid).await.unwrap().data, data);
                cid
            }));
        }

        for handle in handles {
            let cid = handle.await.unwrap();
            assert!(store.has(&cid).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_closed_store_errors() {
        let store = Blockstore::in_memory();
        let cid = store.put_data(b"x".to_vec()).await.unwrap();

        store.close().await.unwrap();

        assert!(matches!(store.get(&cid).await, Err(StorageError::Closed)));
        assert!(matches!(store.has(&cid).await, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_shared_files() {
        let store = Blockstore::in_memory();
        assert!(store.shared_files().await.unwrap().is_empty());

        let a = store.put_data(b"a".to_vec()).await.unwrap();
        let b = store.put_data(b"b".to_vec()).await.unwrap();
        store.record_shared("b.txt", &b).await.unwrap();
        store.record_shared("a.txt", &a).await.unwrap();

        let files = store.shared_files().await.unwrap();
        let names: Vec<_> = files.keys().cloned().collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(files["a.txt"], a);

        // Re-recording a name points it at the new CID
        store.record_shared("a.txt", &b).await.unwrap();
        assert_eq!(store.shared_files().await.unwrap()["a.txt"], b);
    }

    #[tokio::test]
    async fn test_rocksdb_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Blockstore::open(dir.path().join("blocks.db")).unwrap();

        let cid = store.put_data(b"persisted".to_vec()).await.unwrap();
        assert!(store.has(&cid).await.unwrap());
        store.close().await.unwrap();

        let reopened = Blockstore::open(dir.path().join("blocks.db")).unwrap();
        assert_eq!(reopened.get(&cid).await.unwrap().data, b"persisted");
        reopened.close().await.unwrap();
    }
}
