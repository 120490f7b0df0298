//! Durable object storage tier.
//!
//! Object stores have no native TTL: an object stays until deleted, and the
//! envelope's `expires_at` is the only expiry there is. The adapter records
//! that expiry and the tags as custom metadata so operators can inspect
//! objects without decoding them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use blaze_core::{TierDescriptor, TierError, TierId, Timestamp};
use serde::{Deserialize, Serialize};

use super::{BindingError, ListPage, TierPutOptions, TierStore};

const CONTENT_TYPE_JSON: &str = "application/json";
const META_EXPIRES_AT: &str = "expires-at";
const META_TAGS: &str = "tags";
const META_CATEGORY: &str = "category";

/// An object as returned by a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    #[serde(skip)]
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub custom_metadata: BTreeMap<String, String>,
    pub uploaded: Timestamp,
}

impl StoredObject {
    pub fn text(&self) -> Result<&str, BindingError> {
        std::str::from_utf8(&self.body).map_err(|e| BindingError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOptions {
    pub content_type: Option<String>,
    pub custom_metadata: BTreeMap<String, String>,
}

/// Result of a bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub keys: Vec<String>,
    pub truncated: bool,
    pub cursor: Option<String>,
}

/// Binding to an object bucket.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, BindingError>;

    async fn put(
        &self,
        key: &str,
        body: &[u8],
        options: PutObjectOptions,
    ) -> Result<(), BindingError>;

    async fn delete(&self, key: &str) -> Result<(), BindingError>;

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ObjectListing, BindingError>;
}

/// Durable object storage tier.
pub struct DurableObjectTier {
    bucket: Arc<dyn ObjectBucket>,
    descriptor: TierDescriptor,
}

impl DurableObjectTier {
    pub fn new(bucket: Arc<dyn ObjectBucket>) -> Self {
        Self {
            bucket,
            descriptor: TierDescriptor::new(TierId::DurableObject),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.descriptor = self.descriptor.with_priority(priority);
        self
    }

    fn object_options(options: &TierPutOptions) -> PutObjectOptions {
        let mut custom_metadata = BTreeMap::new();
        if let Some(expires_at) = options.expires_at {
            custom_metadata.insert(META_EXPIRES_AT.to_string(), expires_at.to_rfc3339());
        }
        if !options.tags.is_empty() {
            custom_metadata.insert(META_TAGS.to_string(), options.tags.join(","));
        }
        if let Some(category) = &options.category {
            custom_metadata.insert(META_CATEGORY.to_string(), category.clone());
        }
        PutObjectOptions {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            custom_metadata,
        }
    }
}

#[async_trait]
impl TierStore for DurableObjectTier {
    fn descriptor(&self) -> TierDescriptor {
        self.descriptor
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        let object = self
            .bucket
            .get(key)
            .await
            .map_err(|e| e.into_tier_error(TierId::DurableObject))?;
        Ok(object.map(|o| o.body))
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        self.bucket
            .put(key, payload, Self::object_options(options))
            .await
            .map_err(|e| e.into_tier_error(TierId::DurableObject))
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.bucket
            .delete(key)
            .await
            .map_err(|e| e.into_tier_error(TierId::DurableObject))
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        let listing = self
            .bucket
            .list(prefix, cursor, limit)
            .await
            .map_err(|e| e.into_tier_error(TierId::DurableObject))?;
        Ok(ListPage {
            keys: listing.keys,
            cursor: listing.cursor,
            complete: !listing.truncated,
        })
    }
}
