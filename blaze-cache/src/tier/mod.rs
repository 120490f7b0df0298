//! Backing tiers.
//!
//! Every tier implements [`TierStore`], a uniform byte-level
//! get/put/delete/list contract. Tiers differ in latency, durability and
//! queryability but never in contract shape, which is what lets the
//! coordinator treat them interchangeably.
//!
//! Each adapter wraps a binding trait that mirrors the shape of the
//! underlying store:
//!
//! | tier | binding | concrete binding |
//! |---|---|---|
//! | [`FastKvTier`] | [`KvNamespace`] | [`MemoryKvNamespace`] |
//! | [`DurableObjectTier`] | [`ObjectBucket`] | [`LmdbObjectBucket`] |
//! | [`QueryableTier`] | [`CacheTable`] | [`PgCacheTable`] |

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use blaze_core::{TierDescriptor, TierError, TierId, Timestamp};

pub mod durable_object;
pub mod fast_kv;
pub mod lmdb_bucket;
pub mod postgres;
pub mod queryable;

pub use durable_object::{
    DurableObjectTier, ObjectBucket, ObjectListing, PutObjectOptions, StoredObject,
};
pub use fast_kv::{FastKvTier, KvListing, KvNamespace, MemoryKvNamespace};
pub use lmdb_bucket::{BucketStats, LmdbBucketError, LmdbObjectBucket};
pub use postgres::{PgCacheTable, PostgresConfig};
pub use queryable::{CacheRow, CacheTable, QueryableTier};

// ============================================================================
// CONTRACT
// ============================================================================

/// Write options passed to a tier alongside the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierPutOptions {
    /// Native TTL, honored only by tiers that expire entries themselves.
    pub ttl: Option<Duration>,
    /// Envelope expiry, recorded by tiers without native TTL.
    pub expires_at: Option<Timestamp>,
    pub tags: Vec<String>,
    /// Data category of the key, if it has one.
    pub category: Option<String>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Pass back to `list` to fetch the next page.
    pub cursor: Option<String>,
    /// True when no further pages exist.
    pub complete: bool,
}

impl ListPage {
    /// Build a page from up to `limit + 1` sorted keys.
    ///
    /// The extra key, if present, only signals that another page exists.
    pub(crate) fn from_overfetch(mut keys: Vec<String>, limit: usize) -> Self {
        let complete = keys.len() <= limit;
        keys.truncate(limit);
        let cursor = if complete { None } else { keys.last().cloned() };
        Self {
            keys,
            cursor,
            complete,
        }
    }
}

/// Uniform contract over one backing store.
///
/// `get` returns `Ok(None)` for "not found"; errors are reserved for
/// transport and serialization failures.
#[async_trait]
pub trait TierStore: Send + Sync {
    fn descriptor(&self) -> TierDescriptor;

    fn id(&self) -> TierId {
        self.descriptor().id
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    async fn put(&self, key: &str, payload: &[u8], options: &TierPutOptions)
        -> Result<(), TierError>;

    /// Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), TierError>;

    /// List keys starting with `prefix`, in key order, after `cursor`.
    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError>;

    /// Remove entries whose envelope expired before `now`.
    ///
    /// Tiers with native TTL have nothing to do.
    async fn purge_expired(&self, _now: Timestamp) -> Result<u64, TierError> {
        Ok(0)
    }
}

// ============================================================================
// BINDING ERRORS
// ============================================================================

/// Failure reported by a binding to a concrete store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Backend(String),

    #[error("encoding error: {0}")]
    Serialization(String),
}

impl BindingError {
    /// Attribute this failure to `tier`.
    pub fn into_tier_error(self, tier: TierId) -> TierError {
        match self {
            Self::Unavailable(reason) => TierError::Unavailable { tier, reason },
            Self::Backend(reason) => TierError::Backend { tier, reason },
            Self::Serialization(reason) => TierError::Serialization { tier, reason },
        }
    }
}

impl From<tokio_postgres::Error> for BindingError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Backend(e.to_string())
        }
    }
}

impl From<deadpool_postgres::PoolError> for BindingError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<LmdbBucketError> for BindingError {
    fn from(e: LmdbBucketError) -> Self {
        match e {
            LmdbBucketError::Serialization(reason) | LmdbBucketError::Deserialization(reason) => {
                Self::Serialization(reason)
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Run a tier operation under `timeout`.
///
/// Expiry is reported as [`TierError::Timeout`] so callers handle it like
/// any other tier failure.
pub async fn bounded<R, F>(
    tier: TierId,
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<R, TierError>
where
    F: Future<Output = Result<R, TierError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TierError::Timeout {
            tier,
            operation,
            elapsed: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_page_from_overfetch() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let page = ListPage::from_overfetch(keys.clone(), 2);
        assert_eq!(page.keys, vec!["a", "b"]);
        assert_eq!(page.cursor.as_deref(), Some("b"));
        assert!(!page.complete);

        let page = ListPage::from_overfetch(keys, 3);
        assert_eq!(page.keys.len(), 3);
        assert!(page.cursor.is_none());
        assert!(page.complete);
    }

    #[test]
    fn test_binding_error_attribution() {
        let err = BindingError::Unavailable("pool closed".to_string())
            .into_tier_error(TierId::Queryable);
        assert!(matches!(
            err,
            TierError::Unavailable {
                tier: TierId::Queryable,
                ..
            }
        ));
        assert_eq!(
            BindingError::Serialization("x".into())
                .into_tier_error(TierId::DurableObject)
                .tier(),
            TierId::DurableObject
        );
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), TierError> = bounded(
            TierId::FastKv,
            "get",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(TierError::Timeout {
                tier: TierId::FastKv,
                operation: "get",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(TierId::FastKv, "get", Duration::from_secs(1), async {
            Ok::<_, TierError>(7)
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}
