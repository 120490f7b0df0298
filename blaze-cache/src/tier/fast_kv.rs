//! Fast ephemeral key-value tier.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use blaze_core::{add_duration, Clock, SystemClock, TierDescriptor, TierError, TierId, Timestamp};

use super::{BindingError, ListPage, TierPutOptions, TierStore};

/// Keys returned by a KV listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvListing {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
    pub list_complete: bool,
}

/// Binding to a KV namespace with native TTL and eventual consistency.
#[async_trait]
pub trait KvNamespace: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BindingError>;

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        expiration_ttl: Option<Duration>,
    ) -> Result<(), BindingError>;

    async fn delete(&self, key: &str) -> Result<(), BindingError>;

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KvListing, BindingError>;
}

// ============================================================================
// IN-PROCESS NAMESPACE
// ============================================================================

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Timestamp>,
}

impl KvEntry {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process KV namespace whose TTLs are driven by a [`Clock`].
#[derive(Debug)]
pub struct MemoryKvNamespace {
    entries: RwLock<BTreeMap<String, KvEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryKvNamespace {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryKvNamespace {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native expiry recorded for `key`, if any.
    pub fn expiry_of(&self, key: &str) -> Option<Timestamp> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).and_then(|e| e.expires_at))
    }

    fn poisoned() -> BindingError {
        BindingError::Backend("kv namespace lock poisoned".to_string())
    }
}

#[async_trait]
impl KvNamespace for MemoryKvNamespace {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BindingError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        expiration_ttl: Option<Duration>,
    ) -> Result<(), BindingError> {
        let now = self.clock.now();
        let entry = KvEntry {
            value: value.to_vec(),
            expires_at: expiration_ttl.map(|ttl| add_duration(now, ttl)),
        };
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        // Expired entries are dropped lazily on write.
        entries.retain(|_, e| e.is_live(now));
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BindingError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KvListing, BindingError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;

        let lower = match cursor {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let keys: Vec<String> = entries
            .range((lower, Bound::Unbounded))
            .skip_while(|(k, _)| !k.starts_with(prefix) && k.as_str() < prefix)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .take(limit.saturating_add(1))
            .collect();

        let page = ListPage::from_overfetch(keys, limit);
        Ok(KvListing {
            keys: page.keys,
            cursor: page.cursor,
            list_complete: page.complete,
        })
    }
}

// ============================================================================
// TIER ADAPTER
// ============================================================================

/// Fast KV tier.
///
/// Honors native TTL, clamped up to the namespace minimum. The envelope's
/// own expiry stays authoritative on read.
pub struct FastKvTier {
    namespace: Arc<dyn KvNamespace>,
    min_ttl: Duration,
    descriptor: TierDescriptor,
}

impl FastKvTier {
    pub fn new(namespace: Arc<dyn KvNamespace>, min_ttl: Duration) -> Self {
        Self {
            namespace,
            min_ttl,
            descriptor: TierDescriptor::new(TierId::FastKv),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.descriptor = self.descriptor.with_priority(priority);
        self
    }

    fn native_ttl(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.map(|ttl| ttl.max(self.min_ttl))
    }
}

#[async_trait]
impl TierStore for FastKvTier {
    fn descriptor(&self) -> TierDescriptor {
        self.descriptor
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.namespace
            .get(key)
            .await
            .map_err(|e| e.into_tier_error(TierId::FastKv))
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        self.namespace
            .put(key, payload, self.native_ttl(options.ttl))
            .await
            .map_err(|e| e.into_tier_error(TierId::FastKv))
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.namespace
            .delete(key)
            .await
            .map_err(|e| e.into_tier_error(TierId::FastKv))
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        let listing = self
            .namespace
            .list(prefix, cursor, limit)
            .await
            .map_err(|e| e.into_tier_error(TierId::FastKv))?;
        Ok(ListPage {
            keys: listing.keys,
            cursor: listing.cursor,
            complete: listing.list_complete,
        })
    }
}
