//! LMDB-backed object bucket.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide durable,
//! memory-mapped object storage for the durable object tier.
//!
//! # Record Format
//!
//! Each object is stored as
//! `[metadata length: 4 bytes LE][metadata json][body]`, so the body is
//! kept byte-for-byte and metadata can be read without copying it.

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use blaze_core::{Clock, SystemClock};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use super::durable_object::{ObjectBucket, ObjectListing, PutObjectOptions, StoredObject};
use super::{BindingError, ListPage};

const HEADER_LEN: usize = 4;

/// Error type for LMDB bucket operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbBucketError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bucket usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub reads: u64,
    pub hits: u64,
    pub writes: u64,
    pub deletes: u64,
    pub bytes_written: u64,
}

/// LMDB-backed object bucket.
///
/// # Example
///
/// ```ignore
/// use blaze_cache::tier::{DurableObjectTier, LmdbObjectBucket};
///
/// let bucket = LmdbObjectBucket::new("/var/lib/blaze/objects", 512)?;
/// let tier = DurableObjectTier::new(Arc::new(bucket));
/// ```
pub struct LmdbObjectBucket {
    /// The LMDB environment.
    env: Env,
    /// Objects keyed by cache key.
    db: Database<Str, Bytes>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<BucketStats>>,
}

impl LmdbObjectBucket {
    /// Open (or create) a bucket.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or LMDB cannot
    /// open the environment or database.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbBucketError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory for the
        // lifetime of this bucket.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbBucketError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbBucketError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            clock: Arc::new(SystemClock),
            stats: Arc::new(RwLock::new(BucketStats::default())),
        })
    }

    /// Use `clock` for upload timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> BucketStats {
        self.stats.read().map(|s| *s).unwrap_or_default()
    }

    fn encode(object: &StoredObject) -> Result<Vec<u8>, LmdbBucketError> {
        let metadata = serde_json::to_vec(object)
            .map_err(|e| LmdbBucketError::Serialization(e.to_string()))?;
        let metadata_len = u32::try_from(metadata.len())
            .map_err(|_| LmdbBucketError::Serialization("metadata too large".to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + metadata.len() + object.body.len());
        bytes.extend_from_slice(&metadata_len.to_le_bytes());
        bytes.extend_from_slice(&metadata);
        bytes.extend_from_slice(&object.body);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<StoredObject, LmdbBucketError> {
        if bytes.len() < HEADER_LEN {
            return Err(LmdbBucketError::Deserialization(
                "record shorter than header".to_string(),
            ));
        }
        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN]
            .try_into()
            .map_err(|_| LmdbBucketError::Deserialization("Invalid header".into()))?;
        let metadata_end = HEADER_LEN + u32::from_le_bytes(header) as usize;
        if bytes.len() < metadata_end {
            return Err(LmdbBucketError::Deserialization(
                "metadata length exceeds record".to_string(),
            ));
        }

        let mut object: StoredObject = serde_json::from_slice(&bytes[HEADER_LEN..metadata_end])
            .map_err(|e| LmdbBucketError::Deserialization(e.to_string()))?;
        object.body = bytes[metadata_end..].to_vec();
        Ok(object)
    }

    fn get_object(&self, key: &str) -> Result<Option<StoredObject>, LmdbBucketError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        let found = self
            .db
            .get(&rtxn, key)
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.reads += 1;
            if found.is_some() {
                stats.hits += 1;
            }
        }

        found.map(Self::decode).transpose()
    }

    fn put_object(&self, key: &str, object: &StoredObject) -> Result<(), LmdbBucketError> {
        let bytes = Self::encode(object)?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, key, &bytes)
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.writes += 1;
            stats.bytes_written += bytes.len() as u64;
        }
        Ok(())
    }

    fn delete_object(&self, key: &str) -> Result<bool, LmdbBucketError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        let deleted = self
            .db
            .delete(&mut wtxn, key)
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        if deleted {
            if let Ok(mut stats) = self.stats.write() {
                stats.deletes += 1;
            }
        }
        Ok(deleted)
    }

    /// Collect up to `limit` keys with `prefix`, strictly after `cursor`.
    fn collect_keys_with_prefix(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, LmdbBucketError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        let lower = match cursor {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix),
        };
        let iter = self
            .db
            .range(&rtxn, &(lower, Bound::Unbounded))
            .map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| LmdbBucketError::Transaction(e.to_string()))?;
            if !key.starts_with(prefix) {
                if key < prefix {
                    continue;
                }
                break;
            }
            keys.push(key.to_string());
            if keys.len() >= limit {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl ObjectBucket for LmdbObjectBucket {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, BindingError> {
        Ok(self.get_object(key)?)
    }

    async fn put(
        &self,
        key: &str,
        body: &[u8],
        options: PutObjectOptions,
    ) -> Result<(), BindingError> {
        let object = StoredObject {
            body: body.to_vec(),
            content_type: options.content_type,
            custom_metadata: options.custom_metadata,
            uploaded: self.clock.now(),
        };
        Ok(self.put_object(key, &object)?)
    }

    async fn delete(&self, key: &str) -> Result<(), BindingError> {
        self.delete_object(key)?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ObjectListing, BindingError> {
        let keys = self.collect_keys_with_prefix(prefix, cursor, limit.saturating_add(1))?;
        let page = ListPage::from_overfetch(keys, limit);
        Ok(ObjectListing {
            keys: page.keys,
            truncated: !page.complete,
            cursor: page.cursor,
        })
    }
}

impl std::fmt::Debug for LmdbObjectBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbObjectBucket")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
