//! Stale-while-revalidate read path.
//!
//! | now vs. envelope | class | action |
//! |---|---|---|
//! | `now < stale_at` | fresh | serve cached |
//! | `stale_at <= now < expires_at` | stale | serve cached, refresh in background |
//! | `now >= expires_at` or absent | miss | fetch, store, serve |
//! | `force_refresh` | any | fetch, store, serve |
//!
//! Concurrent misses for one key are coalesced: callers queue on a per-key
//! lock and re-read the cache once they hold it, so only the first caller
//! reaches the origin. At most one background refresh per key is in
//! flight at a time.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use blaze_core::{
    BlazeError, BlazeResult, CacheEnvelope, FetchError, Freshness, SwrPolicy, TierId, Timestamp,
    TtlPreset,
};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::coordinator::TierCoordinator;
use crate::jobs::JobKind;

/// Options for [`SwrEngine::get`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwrOptions {
    /// Fetch from the origin regardless of what the cache holds.
    pub force_refresh: bool,
    pub tags: Vec<String>,
    /// Policy for entries written by this read. Defaults to the
    /// coordinator's policy, or the cached entry's own on refresh.
    pub policy: Option<SwrPolicy>,
}

impl SwrOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_policy(mut self, policy: impl Into<SwrPolicy>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_preset(self, preset: TtlPreset) -> Self {
        self.with_policy(preset)
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A value served by [`SwrEngine::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct SwrRead<T> {
    value: T,
    freshness: Freshness,
    cached_at: Timestamp,
    source_tier: Option<TierId>,
}

impl<T> SwrRead<T> {
    fn cached(envelope: CacheEnvelope<T>, freshness: Freshness) -> Self {
        Self {
            freshness,
            cached_at: envelope.cached_at,
            source_tier: envelope.source_tier,
            value: envelope.value,
        }
    }

    fn fetched(envelope: CacheEnvelope<T>) -> Self {
        Self {
            freshness: Freshness::Miss,
            cached_at: envelope.cached_at,
            source_tier: None,
            value: envelope.value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Class of the cached entry at read time; `Miss` when the value came
    /// from the origin.
    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn source_tier(&self) -> Option<TierId> {
        self.source_tier
    }

    pub fn was_cache_hit(&self) -> bool {
        self.source_tier.is_some()
    }
}

/// Removes the key's in-flight lock once its holder is done, unless a
/// newer lock has replaced it.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: &'a Arc<Mutex<()>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.lock));
    }
}

/// Clears the per-key revalidation marker when the refresh job ends.
struct RevalidationGuard {
    map: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Stale-while-revalidate engine over a [`TierCoordinator`].
pub struct SwrEngine {
    coordinator: Arc<TierCoordinator>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    revalidating: Arc<DashMap<String, ()>>,
}

impl SwrEngine {
    pub fn new(coordinator: Arc<TierCoordinator>) -> Self {
        Self {
            coordinator,
            in_flight: DashMap::new(),
            revalidating: Arc::new(DashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<TierCoordinator> {
        &self.coordinator
    }

    /// Keys with a synchronous origin fetch in progress.
    pub fn in_flight_fetches(&self) -> usize {
        self.in_flight.len()
    }

    /// Keys with a background refresh in progress.
    pub fn in_flight_revalidations(&self) -> usize {
        self.revalidating.len()
    }

    /// Serve `key`, calling `fetcher` according to the entry's freshness.
    ///
    /// Errors only when the origin must be consulted synchronously and
    /// fails, or when the configured policy is invalid.
    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: SwrOptions,
    ) -> BlazeResult<SwrRead<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let metrics = self.coordinator.metrics();

        if options.force_refresh {
            metrics.record_forced_refresh();
            let policy = options.policy.unwrap_or_else(|| self.coordinator.default_policy());
            let tags: BTreeSet<String> = options.tags.into_iter().collect();
            return Ok(self.fetch_and_store(key, fetcher, &policy, tags).await?);
        }

        if let Some(envelope) = self.coordinator.get_envelope::<T>(key).await {
            match envelope.classify(self.coordinator.now()) {
                Freshness::Fresh => {
                    metrics.record_freshness(Freshness::Fresh);
                    return Ok(SwrRead::cached(envelope, Freshness::Fresh));
                }
                Freshness::Stale => {
                    metrics.record_freshness(Freshness::Stale);
                    let policy = options
                        .policy
                        .or_else(|| policy_of(&envelope))
                        .unwrap_or_else(|| self.coordinator.default_policy());
                    let mut tags = envelope.tags.clone();
                    tags.extend(options.tags.iter().cloned());
                    self.revalidate(key, fetcher, policy, tags);
                    return Ok(SwrRead::cached(envelope, Freshness::Stale));
                }
                // Expired between the tier read and now.
                Freshness::Miss => {}
            }
        }

        metrics.record_freshness(Freshness::Miss);
        let policy = options.policy.unwrap_or_else(|| self.coordinator.default_policy());
        let tags: BTreeSet<String> = options.tags.into_iter().collect();
        self.fetch_coalesced(key, fetcher, &policy, tags).await
    }

    async fn fetch_coalesced<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        policy: &SwrPolicy,
        tags: BTreeSet<String>,
    ) -> BlazeResult<SwrRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let (_held, waited) = match lock.try_lock() {
            Ok(held) => (held, false),
            Err(_) => (lock.lock().await, true),
        };
        let _cleanup = InFlightGuard {
            map: &self.in_flight,
            key,
            lock: &lock,
        };

        if waited {
            if let Some(envelope) = self.coordinator.get_envelope::<T>(key).await {
                if envelope.classify(self.coordinator.now()) == Freshness::Fresh {
                    tracing::debug!(key, "Served entry filled by a concurrent fetch");
                    return Ok(SwrRead::cached(envelope, Freshness::Fresh));
                }
            }
        }

        Ok(self.fetch_and_store(key, fetcher, policy, tags).await?)
    }

    async fn fetch_and_store<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        policy: &SwrPolicy,
        tags: BTreeSet<String>,
    ) -> Result<SwrRead<T>, FetchError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let value = match fetcher().await {
            Ok(value) => value,
            Err(e) => {
                self.coordinator.metrics().record_fetch_error();
                tracing::warn!(key, error = %e, "Origin fetch failed");
                return Err(e);
            }
        };

        let envelope = CacheEnvelope::new(value, self.coordinator.now(), policy, tags);
        if let Err(e) = self.coordinator.put_envelope(key, &envelope).await {
            tracing::warn!(key, error = %e, "Fetched value could not be cached");
        }
        Ok(SwrRead::fetched(envelope))
    }

    fn revalidate<T, F, Fut>(&self, key: &str, fetcher: F, policy: SwrPolicy, tags: BTreeSet<String>)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        if self.revalidating.insert(key.to_string(), ()).is_some() {
            tracing::debug!(key, "Revalidation already in flight");
            return;
        }
        let guard = RevalidationGuard {
            map: Arc::clone(&self.revalidating),
            key: key.to_string(),
        };

        let coordinator = Arc::clone(&self.coordinator);
        let key_owned = key.to_string();
        self.coordinator.jobs().spawn(JobKind::Revalidation, key, async move {
            let _guard = guard;
            let value = match fetcher().await {
                Ok(value) => value,
                Err(e) => {
                    coordinator.metrics().record_fetch_error();
                    return Err(BlazeError::from(e));
                }
            };

            let envelope = CacheEnvelope::new(value, coordinator.now(), &policy, tags);
            let outcome = coordinator.put_envelope(&key_owned, &envelope).await?;
            if outcome.all_failed() {
                tracing::warn!(key = %key_owned, "Revalidated value was not stored by any tier");
            } else {
                coordinator.metrics().record_refresh();
                tracing::debug!(key = %key_owned, "Revalidated stale cache entry");
            }
            Ok(())
        });
    }
}

impl std::fmt::Debug for SwrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrEngine")
            .field("coordinator", &self.coordinator)
            .field("in_flight_fetches", &self.in_flight_fetches())
            .field("in_flight_revalidations", &self.in_flight_revalidations())
            .finish()
    }
}

/// Policy the envelope was written under.
fn policy_of<T>(envelope: &CacheEnvelope<T>) -> Option<SwrPolicy> {
    let ttl = (envelope.expires_at - envelope.cached_at).to_std().ok()?;
    let window = (envelope.expires_at - envelope.stale_at).to_std().ok()?;
    SwrPolicy::new(ttl, window).ok()
}
