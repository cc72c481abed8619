//! Embedded key-value stores backing the blockstore
//!
//! The blockstore only sees the [`PersistentKV`] capability: named partitions
//! ("buckets") of binary keys and values. Transactional isolation of a single
//! put/get is the backend's job.

use rocksdb::{DBCompressionType, Options, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::storage::StorageError;

/// Partition holding block payloads keyed by binary CID
pub const BLOCKS_BUCKET: &str = "blocks";

/// Partition holding small auxiliary records
pub const META_BUCKET: &str = "meta";

const BUCKETS: [&str; 2] = [BLOCKS_BUCKET, META_BUCKET];

/// Minimal key-value capability consumed by the blockstore.
///
/// Calls may block; async callers are expected to move them off the runtime.
pub trait PersistentKV: Send + Sync {
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Presence check that does not copy the value out
    fn contains(&self, bucket: &str, key: &[u8]) -> Result<bool, StorageError>;

    /// Removing an absent key succeeds
    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError>;

    /// Release the underlying handle. Later calls fail with `Closed`.
    fn close(&self) -> Result<(), StorageError>;
}

/// RocksDB store with one column family per bucket
pub struct RocksKv {
    db: RwLock<Option<Arc<DB>>>,
    path: PathBuf,
}

impl RocksKv {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Point lookups by CID dominate
        opts.optimize_for_point_lookup(256);
        opts.set_enable_pipelined_write(true);

        // File payloads are usually compressed already
        opts.set_compression_type(DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);

        let db = DB::open_cf(&opts, path.as_ref(), BUCKETS)?;

        info!("Opened RocksDB datastore at {:?}", path.as_ref());
        Ok(Self {
            db: RwLock::new(Some(Arc::new(db))),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<DB>, StorageError> {
        let guard = self
            .db
            .read()
            .map_err(|_| StorageError::Backend("datastore lock poisoned".to_string()))?;
        guard.as_ref().cloned().ok_or(StorageError::Closed)
    }
}

fn column<'a>(db: &'a DB, bucket: &str) -> Result<&'a rocksdb::ColumnFamily, StorageError> {
    db.cf_handle(bucket)
        .ok_or_else(|| StorageError::UnknownBucket(bucket.to_string()))
}

impl PersistentKV for RocksKv {
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let db = self.handle()?;
        db.put_cf(column(&db, bucket)?, key, value)?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let db = self.handle()?;
        let value = db.get_cf(column(&db, bucket)?, key)?;
        Ok(value)
    }

    fn contains(&self, bucket: &str, key: &[u8]) -> Result<bool, StorageError> {
        let db = self.handle()?;
        let pinned = db.get_pinned_cf(column(&db, bucket)?, key)?;
        Ok(pinned.is_some())
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError> {
        let db = self.handle()?;
        db.delete_cf(column(&db, bucket)?, key)?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut guard = self
            .db
            .write()
            .map_err(|_| StorageError::Backend("datastore lock poisoned".to_string()))?;

        match guard.take() {
            Some(db) => {
                db.flush()?;
                info!("Closed RocksDB datastore at {:?}", self.path);
                Ok(())
            }
            None => {
                debug!("RocksDB datastore at {:?} already closed", self.path);
                Ok(())
            }
        }
    }
}

type Buckets = HashMap<String, HashMap<Vec<u8>, Vec<u8>>>;

/// Process-local store, lost on exit
pub struct MemoryKv {
    // None once closed
    buckets: RwLock<Option<Buckets>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(Some(HashMap::new())),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Backend("datastore lock poisoned".to_string())
}

impl PersistentKV for MemoryKv {
    fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut guard = self.buckets.write().map_err(poisoned)?;
        let buckets = guard.as_mut().ok_or(StorageError::Closed)?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self.buckets.read().map_err(poisoned)?;
        let buckets = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn contains(&self, bucket: &str, key: &[u8]) -> Result<bool, StorageError> {
        let guard = self.buckets.read().map_err(poisoned)?;
        let buckets = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(buckets.get(bucket).is_some_and(|b| b.contains_key(key)))
    }

    fn delete(&self, bucket: &str, key: &[u8]) -> Result<(), StorageError> {
        let mut guard = self.buckets.write().map_err(poisoned)?;
        let buckets = guard.as_mut().ok_or(StorageError::Closed)?;
        if let Some(b) = buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.buckets.write().map_err(poisoned)?.take();
        Ok(())
    }
}
