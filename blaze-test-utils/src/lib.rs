//! Blaze Test Utilities
//!
//! Shared test infrastructure for the Blaze workspace:
//! - In-memory tier and cache-table doubles with call counters
//! - Failing, flaky and slow tier wrappers
//! - Counting origin fetchers
//! - Proptest generators for keys, tags and policies
//! - Fixtures for building coordinators over memory tiers

pub use blaze_core::{
    BlazeError, BlazeResult, CacheConfig, CacheEnvelope, Clock, FetchError, Freshness,
    ManualClock, SwrPolicy, TierDescriptor, TierError, TierId, Timestamp,
};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Ready;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use blaze_cache::tier::{BindingError, CacheRow, CacheTable, ListPage, TierPutOptions, TierStore};

// ============================================================================
// MEMORY CACHE TABLE
// ============================================================================

/// In-memory `cache_store` / `cache_tags` for the queryable tier.
#[derive(Debug, Default)]
pub struct MemoryCacheTable {
    rows: RwLock<BTreeMap<String, CacheRow>>,
    tags: RwLock<BTreeSet<(String, String)>>,
}

fn poisoned() -> BindingError {
    BindingError::Backend("lock poisoned".to_string())
}

impl MemoryCacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, key: &str) -> Option<CacheRow> {
        self.rows.read().ok()?.get(key).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn tag_rows(&self) -> usize {
        self.tags.read().map(|tags| tags.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CacheTable for MemoryCacheTable {
    async fn select(&self, key: &str) -> Result<Option<CacheRow>, BindingError> {
        Ok(self.rows.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    async fn upsert(&self, row: &CacheRow) -> Result<(), BindingError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let mut row = row.clone();
        if let Some(existing) = rows.get(&row.cache_key) {
            row.created_at = existing.created_at;
        }
        rows.insert(row.cache_key.clone(), row);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BindingError> {
        Ok(self
            .rows
            .write()
            .map_err(|_| poisoned())?
            .remove(key)
            .is_some())
    }

    async fn list_keys(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, BindingError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| after.map_or(true, |after| key.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_expired(&self, now: Timestamp) -> Result<u64, BindingError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let before = rows.len();
        rows.retain(|_, row| row.expires_at.map_or(true, |expires_at| expires_at > now));
        let purged = (before - rows.len()) as u64;

        let mut tags = self.tags.write().map_err(|_| poisoned())?;
        tags.retain(|(_, key)| rows.contains_key(key));
        Ok(purged)
    }

    async fn insert_tag(&self, tag: &str, key: &str) -> Result<(), BindingError> {
        self.tags
            .write()
            .map_err(|_| poisoned())?
            .insert((tag.to_string(), key.to_string()));
        Ok(())
    }

    async fn keys_for_tag(&self, tag: &str) -> Result<Vec<String>, BindingError> {
        Ok(self
            .tags
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|(t, _)| t == tag)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn delete_tag(&self, tag: &str) -> Result<u64, BindingError> {
        let mut tags = self.tags.write().map_err(|_| poisoned())?;
        let before = tags.len();
        tags.retain(|(t, _)| t != tag);
        Ok((before - tags.len()) as u64)
    }
}

// ============================================================================
// TIER DOUBLES
// ============================================================================

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
}

impl CallCounts {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

/// Raw byte store posing as any tier. Keeps whatever it is given and never
/// expires anything itself.
#[derive(Debug)]
pub struct MemoryTier {
    descriptor: TierDescriptor,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    last_options: RwLock<BTreeMap<String, TierPutOptions>>,
    pub calls: CallCounts,
}

impl MemoryTier {
    pub fn new(id: TierId) -> Self {
        Self::with_descriptor(TierDescriptor::new(id))
    }

    pub fn with_descriptor(descriptor: TierDescriptor) -> Self {
        Self {
            descriptor,
            entries: RwLock::new(BTreeMap::new()),
            last_options: RwLock::new(BTreeMap::new()),
            calls: CallCounts::default(),
        }
    }

    /// Store `payload` directly, bypassing the call counters.
    pub fn seed(&self, key: &str, payload: impl Into<Vec<u8>>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), payload.into());
        }
    }

    /// Encode and store `envelope` directly.
    pub fn seed_envelope<T: serde::Serialize>(&self, key: &str, envelope: &CacheEnvelope<T>) {
        let payload = envelope.encode().unwrap_or_default();
        self.seed(key, payload);
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// Options passed with the most recent write of `key`.
    pub fn last_options(&self, key: &str) -> Option<TierPutOptions> {
        self.last_options.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn descriptor(&self) -> TierDescriptor {
        self.descriptor
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.calls.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw(key))
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        self.calls.puts.fetch_add(1, Ordering::SeqCst);
        self.seed(key, payload);
        if let Ok(mut last) = self.last_options.write() {
            last.insert(key.to_string(), options.clone());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map_err(|_| TierError::backend(self.descriptor.id, "lock poisoned"))?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| cursor.map_or(true, |c| key.as_str() > c))
            .take(limit.saturating_add(1))
            .cloned()
            .collect();
        let complete = keys.len() <= limit;
        keys.truncate(limit);
        Ok(ListPage {
            cursor: if complete { None } else { keys.last().cloned() },
            keys,
            complete,
        })
    }
}

/// Tier whose every operation fails as unavailable.
#[derive(Debug)]
pub struct FailingTier {
    descriptor: TierDescriptor,
    pub calls: CallCounts,
}

impl FailingTier {
    pub fn new(id: TierId) -> Self {
        Self {
            descriptor: TierDescriptor::new(id),
            calls: CallCounts::default(),
        }
    }

    fn error(&self) -> TierError {
        TierError::Unavailable {
            tier: self.descriptor.id,
            reason: "binding offline".to_string(),
        }
    }
}

#[async_trait]
impl TierStore for FailingTier {
    fn descriptor(&self) -> TierDescriptor {
        self.descriptor
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, TierError> {
        self.calls.gets.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn put(&self, _: &str, _: &[u8], _: &TierPutOptions) -> Result<(), TierError> {
        self.calls.puts.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn delete(&self, _key: &str) -> Result<(), TierError> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn list(&self, _: &str, _: Option<&str>, _: usize) -> Result<ListPage, TierError> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);
        Err(self.error())
    }

    async fn purge_expired(&self, _now: Timestamp) -> Result<u64, TierError> {
        Err(self.error())
    }
}

/// Wrapper whose reads and writes can be switched to fail at runtime.
pub struct FlakyTier {
    inner: Arc<dyn TierStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyTier {
    pub fn new(inner: Arc<dyn TierStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn error(&self) -> TierError {
        TierError::backend(self.inner.id(), "injected failure")
    }
}

#[async_trait]
impl TierStore for FlakyTier {
    fn descriptor(&self) -> TierDescriptor {
        self.inner.descriptor()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.error());
        }
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.error());
        }
        self.inner.put(key, payload, options).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.error());
        }
        self.inner.delete(key).await
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.error());
        }
        self.inner.list(prefix, cursor, limit).await
    }
}

/// Wrapper that sleeps before every operation.
pub struct SlowTier {
    inner: Arc<dyn TierStore>,
    delay: Duration,
}

impl SlowTier {
    pub fn new(inner: Arc<dyn TierStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl TierStore for SlowTier {
    fn descriptor(&self) -> TierDescriptor {
        self.inner.descriptor()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        payload: &[u8],
        options: &TierPutOptions,
    ) -> Result<(), TierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, payload, options).await
    }

    async fn delete(&self, key: &str) -> Result<(), TierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn list(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, TierError> {
        tokio::time::sleep(self.delay).await;
        self.inner.list(prefix, cursor, limit).await
    }
}

// ============================================================================
// ORIGIN FETCHERS
// ============================================================================

/// Builds origin fetchers that count their invocations.
#[derive(Debug, Clone, Default)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// One-shot fetcher yielding `value`.
    pub fn returning<T>(&self, value: T) -> impl FnOnce() -> Ready<Result<T, FetchError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    /// One-shot fetcher failing with an origin error for `key`.
    pub fn failing<T>(&self, key: &str) -> impl FnOnce() -> Ready<Result<T, FetchError>> + Send + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        let key = key.to_string();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(FetchError::origin(key, "origin unavailable")))
        }
    }

    /// Per-key fetcher for warming, computing each result with `f`.
    pub fn keyed<T, F>(&self, f: F) -> impl Fn(String) -> Ready<Result<T, FetchError>>
    where
        F: Fn(&str) -> Result<T, FetchError>,
    {
        let calls = Arc::clone(&self.calls);
        move |key: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(f(&key))
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate a namespaced cache key.
    pub fn arb_key() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("mlb"), Just("nfl"), Just("ncaaf"), Just("nba")],
            prop_oneof![Just("game"), Just("standings"), Just("roster"), Just("nil")],
            "[a-z0-9]{1,12}",
        )
            .prop_map(|(sport, kind, id)| format!("bsi:{sport}:{kind}:{id}"))
    }

    /// Generate a small tag set.
    pub fn arb_tags() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z]{2,8}", 0..4)
    }

    /// Generate a valid policy: `0 < swr_window < ttl`.
    pub fn arb_policy() -> impl Strategy<Value = SwrPolicy> {
        (2u64..86_400).prop_flat_map(|ttl| {
            (Just(ttl), 1u64..ttl).prop_map(|(ttl, swr)| {
                SwrPolicy::from_secs(ttl, swr).unwrap_or_else(|_| unreachable!("0 < swr < ttl"))
            })
        })
    }

    /// Generate a tier id.
    pub fn arb_tier_id() -> impl Strategy<Value = TierId> {
        prop_oneof![
            Just(TierId::FastKv),
            Just(TierId::DurableObject),
            Just(TierId::Queryable),
        ]
    }

    /// Generate a JSON payload.
    pub fn arb_json_value() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,32}".prop_map(serde_json::Value::from),
            prop::collection::vec(any::<u16>(), 0..8).prop_map(serde_json::Value::from),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Fixtures for common cache setups.

    use super::*;
    use blaze_cache::TierCoordinator;
    use chrono::TimeZone;

    /// Fixed start instant for deterministic tests.
    pub fn t0() -> Timestamp {
        chrono::Utc
            .with_ymd_and_hms(2025, 9, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(chrono::Utc::now)
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(t0())
    }

    /// One memory tier per tier id, fastest first.
    pub fn memory_tiers() -> [Arc<MemoryTier>; 3] {
        TierId::ALL.map(|id| Arc::new(MemoryTier::new(id)))
    }

    /// Upcast tier doubles for [`TierCoordinator::new`].
    pub fn as_stores<T: TierStore + 'static>(tiers: &[Arc<T>]) -> Vec<Arc<dyn TierStore>> {
        tiers
            .iter()
            .map(|tier| Arc::clone(tier) as Arc<dyn TierStore>)
            .collect()
    }

    /// Coordinator over `tiers` driven by `clock`.
    pub fn coordinator(
        tiers: Vec<Arc<dyn TierStore>>,
        clock: &ManualClock,
    ) -> TierCoordinator {
        coordinator_with_config(tiers, clock, CacheConfig::default())
    }

    pub fn coordinator_with_config(
        tiers: Vec<Arc<dyn TierStore>>,
        clock: &ManualClock,
        config: CacheConfig,
    ) -> TierCoordinator {
        match TierCoordinator::new(tiers, config) {
            Ok(coordinator) => coordinator.with_clock(Arc::new(clock.clone())),
            Err(e) => panic!("invalid test config: {e}"),
        }
    }

    /// Policy from whole seconds.
    pub fn policy(ttl_secs: u64, swr_secs: u64) -> SwrPolicy {
        match SwrPolicy::from_secs(ttl_secs, swr_secs) {
            Ok(policy) => policy,
            Err(e) => panic!("invalid test policy: {e}"),
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache results.

    use super::*;

    /// Assert the result failed with an origin fetch error.
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &BlazeResult<T>) {
        assert!(
            matches!(result, Err(BlazeError::Fetch(_))),
            "Expected fetch error, got {:?}",
            result
        );
    }

    /// Assert the result failed with a configuration error.
    pub fn assert_config_error<T: std::fmt::Debug>(result: &BlazeResult<T>) {
        assert!(
            matches!(result, Err(BlazeError::Config(_))),
            "Expected config error, got {:?}",
            result
        );
    }

    /// Assert `tier` holds a decodable envelope for `key`.
    pub fn assert_tier_holds(tier: &MemoryTier, key: &str) {
        let payload = tier
            .raw(key)
            .unwrap_or_else(|| panic!("{} holds no entry for {}", tier.descriptor().id, key));
        assert!(
            CacheEnvelope::<serde_json::Value>::decode(&payload).is_ok(),
            "{} holds a corrupt entry for {}",
            tier.descriptor().id,
            key
        );
    }
}
