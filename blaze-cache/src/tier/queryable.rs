//! Queryable relational tier.
//!
//! Backed by a `cache_store` table plus a `cache_tags` table that holds the
//! durable tag index. Rows are never expired by the store itself; the
//! expiry sweeper removes them through [`TierStore::purge_expired`].

use std::sync::Arc;

use async_trait::async_trait;
use blaze_core::{Clock, SystemClock, TierDescriptor, TierError, TierId, Timestamp};

use super::{BindingError, ListPage, TierPutOptions, TierStore};

/// One row of `cache_store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub cache_key: String,
    pub payload: Vec<u8>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Binding to the relational cache tables.
#[async_trait]
pub trait CacheTable: Send + Sync {
    async fn select(&self, key: &str) -> Result<Option<CacheRow>, BindingError>;

    /// Insert or replace a row. `created_at` is kept on replace.
    async fn upsert(&self, row: &CacheRow) -> Result<(), BindingError>;

    /// Returns whether a row was removed.
    async fn delete(&self, key: &str) -> Result<bool, BindingError>;

    /// Up to `limit` keys with `prefix`, in key order, strictly after `after`.
    async fn list_keys(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, BindingError>;

    /// Delete rows with `expires_at <= now` and any tag rows left pointing
    /// at missing keys. Returns the number of cache rows removed.
    async fn delete_expired(&self, now: Timestamp) -> Result<u64, BindingError>;

    async fn insert_tag(&self, tag: &str, key: &str) -> Result<(), BindingError>;

    async fn keys_for_tag(&self, tag: &str) -> Result<Vec<String>, BindingError>;

    /// Returns the number of tag rows removed.
    async fn delete_tag(&self, tag: &str) -> Result<u64, BindingError>;
}

/// Queryable relational tier.
pub struct QueryableTier {
    table: Arc<dyn CacheTable>,
    descriptor: TierDescriptor,
    clock: Arc<dyn Clock>,
}

impl QueryableTier {
    pub fn new(table: Arc<dyn CacheTable>) -> Self {
        Self {
            table,
            descriptor: TierDescriptor::new(TierId::Queryable),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.descriptor = self.descriptor.with_priority(priority);
        self
    }

    /// Use `clock` for `created_at` / `updated_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &Arc<dyn CacheTable> {
        &self.table
    }
}

#[async_trait]
impl TierStore for QueryableTier {
    fn descriptor(&self) -> TierDescriptor {
        self.descriptor
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        let row = self
            .table
            .select(key)
            .await
            .map_err(|e| e.into_tier_error(TierId::Queryable))?;
        Ok(row.map(|r| r.payload))
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        let now = self.clock.now();
        let row = CacheRow {
            cache_key: key.to_string(),
            payload: payload.to_vec(),
            category: options.category.clone(),
            tags: options.tags.clone(),
            expires_at: options.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.table
            .upsert(&row)
            .await
            .map_err(|e| e.into_tier_error(TierId::Queryable))
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.table
            .delete(key)
            .await
            .map(|_| ())
            .map_err(|e| e.into_tier_error(TierId::Queryable))
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        let keys = self
            .table
            .list_keys(prefix, cursor, limit.saturating_add(1))
            .await
            .map_err(|e| e.into_tier_error(TierId::Queryable))?;
        Ok(ListPage::from_overfetch(keys, limit))
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, TierError> {
        self.table
            .delete_expired(now)
            .await
            .map_err(|e| e.into_tier_error(TierId::Queryable))
    }
}
