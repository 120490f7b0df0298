//! Tag to key index for bulk invalidation.
//!
//! [`InMemoryTagIndex`] is scoped to one process: keys tagged by another
//! coordinator instance, or before a restart, are invisible to it.
//! [`QueryableTagIndex`] stores `(tag, cache_key)` rows in the queryable
//! tier's `cache_tags` table and is shared by every instance using the same
//! database.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use blaze_core::{TierError, TierId};
use thiserror::Error;

use crate::tier::CacheTable;

/// Failures of a tag index, attributed to the index rather than a tier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagIndexError {
    #[error("Tag index {index} timed out after {elapsed:?} during {operation}")]
    Timeout {
        index: &'static str,
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("Tag index {index} lock poisoned")]
    Poisoned { index: &'static str },

    #[error("Tag index store failed: {0}")]
    Store(#[from] TierError),
}

#[async_trait]
pub trait TagIndex: Send + Sync {
    /// Record that `key` was written with each of `tags`.
    async fn register(&self, key: &str, tags: &[String]) -> Result<(), TagIndexError>;

    /// Keys registered under `tag`.
    async fn keys_for(&self, tag: &str) -> Result<Vec<String>, TagIndexError>;

    /// Forget `tag` and all its keys.
    async fn remove_tag(&self, tag: &str) -> Result<(), TagIndexError>;

    /// Whether entries survive restarts and are visible to other instances.
    fn is_durable(&self) -> bool;

    /// Short label used in logs and errors.
    fn name(&self) -> &'static str;
}

/// Run one index call under `timeout`, attributing a timeout to `index`.
pub async fn bounded_index<R, F>(
    index: &'static str,
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<R, TagIndexError>
where
    F: Future<Output = Result<R, TagIndexError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TagIndexError::Timeout {
            index,
            operation,
            elapsed: timeout,
        }),
    }
}

const IN_MEMORY: &str = "in_memory";

/// Process-local tag index.
#[derive(Debug, Default)]
pub struct InMemoryTagIndex {
    tags: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl InMemoryTagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tags currently tracked.
    pub fn tag_count(&self) -> usize {
        self.tags.read().map(|tags| tags.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TagIndex for InMemoryTagIndex {
    async fn register(&self, key: &str, tags: &[String]) -> Result<(), TagIndexError> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut index = self
            .tags
            .write()
            .map_err(|_| TagIndexError::Poisoned { index: IN_MEMORY })?;
        for tag in tags {
            index.entry(tag.clone()).or_default().insert(key.to_string());
        }
        Ok(())
    }

    async fn keys_for(&self, tag: &str) -> Result<Vec<String>, TagIndexError> {
        let index = self
            .tags
            .read()
            .map_err(|_| TagIndexError::Poisoned { index: IN_MEMORY })?;
        Ok(index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_tag(&self, tag: &str) -> Result<(), TagIndexError> {
        self.tags
            .write()
            .map_err(|_| TagIndexError::Poisoned { index: IN_MEMORY })?
            .remove(tag);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        IN_MEMORY
    }
}

/// Tag index stored in the queryable tier.
pub struct QueryableTagIndex {
    table: Arc<dyn CacheTable>,
}

impl QueryableTagIndex {
    pub fn new(table: Arc<dyn CacheTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl TagIndex for QueryableTagIndex {
    async fn register(&self, key: &str, tags: &[String]) -> Result<(), TagIndexError> {
        for tag in tags {
            self.table
                .insert_tag(tag, key)
                .await
                .map_err(|e| e.into_tier_error(TierId::Queryable))?;
        }
        Ok(())
    }

    async fn keys_for(&self, tag: &str) -> Result<Vec<String>, TagIndexError> {
        self.table
            .keys_for_tag(tag)
            .await
            .map_err(|e| TagIndexError::Store(e.into_tier_error(TierId::Queryable)))
    }

    async fn remove_tag(&self, tag: &str) -> Result<(), TagIndexError> {
        self.table
            .delete_tag(tag)
            .await
            .map(|_| ())
            .map_err(|e| TagIndexError::Store(e.into_tier_error(TierId::Queryable)))
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "queryable"
    }
}
