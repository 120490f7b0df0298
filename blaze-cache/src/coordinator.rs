//! Multi-tier cache coordinator.
//!
//! Reads waterfall through the tiers fastest first and stop at the first
//! live entry; tiers that missed are refilled by detached promotion jobs.
//! Writes and deletes fan out to every tier concurrently and succeed when
//! any tier accepts them.
//!
//! Tier failures never reach the caller. Every tier call is bounded by
//! `tier_timeout`, and errors, timeouts and corrupt payloads are logged and
//! treated as that tier missing. With no tiers configured the coordinator
//! is a pass-through: reads miss and writes do nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blaze_core::{
    category_of, BlazeError, BlazeResult, CacheConfig, CacheEnvelope, Clock, ConfigError, SwrPolicy,
    SystemClock, TierId, Timestamp, TtlPreset,
};
use futures_util::future::join_all;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;

use crate::jobs::{BackgroundJobs, JobKind};
use crate::metrics::MetricsCollector;
use crate::tag_index::{bounded_index, InMemoryTagIndex, TagIndex};
use crate::tier::{bounded, TierPutOptions, TierStore};

// ============================================================================
// OPTIONS AND OUTCOMES
// ============================================================================

/// Options for [`TierCoordinator::put`].
///
/// An explicit `policy` wins. Otherwise `ttl` / `swr_window` override the
/// configured defaults; a default stale window that does not fit inside a
/// caller TTL falls back to half the TTL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    pub swr_window: Option<Duration>,
    pub tags: Vec<String>,
    pub policy: Option<SwrPolicy>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_swr_window(mut self, window: Duration) -> Self {
        self.swr_window = Some(window);
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

    /// Resolve the freshness policy for this write.
    pub fn resolve_policy(&self, config: &CacheConfig) -> Result<SwrPolicy, ConfigError> {
        if let Some(policy) = self.policy {
            return Ok(policy);
        }
        match (self.ttl, self.swr_window) {
            (Some(ttl), Some(window)) => SwrPolicy::new(ttl, window),
            (Some(ttl), None) => SwrPolicy::for_ttl(ttl, config.default_swr_window),
            (None, Some(window)) => SwrPolicy::new(config.default_ttl, window),
            (None, None) => config.default_policy(),
        }
    }
}

/// Per-tier result of a fan-out write or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutOutcome {
    pub succeeded: Vec<TierId>,
    pub failed: Vec<TierId>,
}

impl FanOutOutcome {
    /// Number of tiers that accepted the operation.
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }

    /// True when at least one tier was asked and none accepted.
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Result of an expiry sweep across tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: u64,
    pub failed: Vec<TierId>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Coordinates an ordered, possibly empty list of tiers.
pub struct TierCoordinator {
    tiers: Vec<Arc<dyn TierStore>>,
    tag_index: Arc<dyn TagIndex>,
    jobs: BackgroundJobs,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    default_policy: SwrPolicy,
}

impl TierCoordinator {
    /// Build a coordinator over `tiers`.
    ///
    /// Absent tiers and tiers not enabled in `config` are skipped. The rest
    /// are consulted in ascending priority.
    pub fn new(tiers: Vec<Arc<dyn TierStore>>, config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let default_policy = config.default_policy()?;

        let mut tiers: Vec<_> = tiers
            .into_iter()
            .filter(|tier| {
                let descriptor = tier.descriptor();
                descriptor.present && config.is_tier_enabled(descriptor.id)
            })
            .collect();
        tiers.sort_by_key(|tier| {
            let descriptor = tier.descriptor();
            (descriptor.priority, descriptor.id)
        });

        let order: Vec<&'static str> = tiers.iter().map(|t| t.id().as_str()).collect();
        tracing::info!(tiers = ?order, "Cache coordinator initialized");

        Ok(Self {
            tiers,
            tag_index: Arc::new(InMemoryTagIndex::new()),
            jobs: BackgroundJobs::new(config.max_background_jobs),
            metrics: Arc::new(MetricsCollector::new()),
            clock: Arc::new(SystemClock),
            config,
            default_policy,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tag_index(mut self, tag_index: Arc<dyn TagIndex>) -> Self {
        self.tag_index = tag_index;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Live tiers in lookup order.
    pub fn tiers(&self) -> &[Arc<dyn TierStore>] {
        &self.tiers
    }

    pub fn tier(&self, id: TierId) -> Option<&Arc<dyn TierStore>> {
        self.tiers.iter().find(|tier| tier.id() == id)
    }

    pub fn tag_index(&self) -> &Arc<dyn TagIndex> {
        &self.tag_index
    }

    pub fn jobs(&self) -> &BackgroundJobs {
        &self.jobs
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_policy(&self) -> SwrPolicy {
        self.default_policy
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Wait for all in-flight background jobs.
    pub async fn flush(&self) {
        self.jobs.flush().await;
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read the first live envelope for `key`, promoting it into every
    /// faster tier that missed.
    pub async fn get_envelope<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEnvelope<T>> {
        let now = self.clock.now();
        let timeout = self.config.tier_timeout;
        let mut missed: Vec<Arc<dyn TierStore>> = Vec::new();

        for tier in &self.tiers {
            let id = tier.id();
            let started = Instant::now();
            let result = bounded(id, "get", timeout, tier.get(key)).await;
            let elapsed = started.elapsed();

            let payload = match result {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    self.metrics.record_miss(id, elapsed);
                    missed.push(Arc::clone(tier));
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key, tier = %id, error = %e, "Tier read failed, treating as miss");
                    self.metrics.record_miss(id, elapsed);
                    missed.push(Arc::clone(tier));
                    continue;
                }
            };

            let mut raw = match CacheEnvelope::<serde_json::Value>::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(key, tier = %id, error = %e, "Corrupt cache entry, treating as miss");
                    self.metrics.record_miss(id, elapsed);
                    self.purge_corrupt(Arc::clone(tier), key);
                    missed.push(Arc::clone(tier));
                    continue;
                }
            };

            if raw.is_expired(now) {
                tracing::debug!(key, tier = %id, expires_at = %raw.expires_at, "Expired cache entry");
                self.metrics.record_miss(id, elapsed);
                missed.push(Arc::clone(tier));
                continue;
            }

            let value = match serde_json::from_value::<T>(std::mem::take(&mut raw.value)) {
                Ok(value) => value,
                Err(e) => {
                    // The entry is intact; only this caller's type disagrees with it.
                    tracing::warn!(key, tier = %id, error = %e, "Cached value does not match requested type");
                    self.metrics.record_miss(id, elapsed);
                    return None;
                }
            };

            self.metrics.record_hit(id, elapsed);
            let envelope = raw.map(|_| value);
            self.promote(key, payload, &envelope, now, missed);
            return Some(envelope.with_source_tier(id));
        }

        None
    }

    /// Read the value for `key` and the tier that served it.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<(T, TierId)> {
        let envelope = self.get_envelope::<T>(key).await?;
        let tier = envelope.source_tier?;
        Some((envelope.into_value(), tier))
    }

    /// Whether any tier holds a live entry for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.get_envelope::<IgnoredAny>(key).await.is_some()
    }

    fn promote<T>(
        &self,
        key: &str,
        payload: Vec<u8>,
        envelope: &CacheEnvelope<T>,
        now: Timestamp,
        targets: Vec<Arc<dyn TierStore>>,
    ) {
        if targets.is_empty() {
            return;
        }

        let payload: Arc<[u8]> = payload.into();
        let options = Arc::new(self.put_options(key, envelope, now));
        let timeout = self.config.tier_timeout;

        for tier in targets {
            let key_owned = key.to_string();
            let payload = Arc::clone(&payload);
            let options = Arc::clone(&options);
            self.jobs.spawn(JobKind::Promotion, key, async move {
                let id = tier.id();
                bounded(id, "put", timeout, tier.put(&key_owned, &payload, &options)).await?;
                tracing::debug!(key = %key_owned, tier = %id, "Promoted cache entry");
                Ok::<(), BlazeError>(())
            });
        }
    }

    fn purge_corrupt(&self, tier: Arc<dyn TierStore>, key: &str) {
        let key_owned = key.to_string();
        let timeout = self.config.tier_timeout;
        self.jobs.spawn(JobKind::CorruptPurge, key, async move {
            let id = tier.id();
            bounded(id, "delete", timeout, tier.delete(&key_owned)).await?;
            tracing::debug!(key = %key_owned, tier = %id, "Purged corrupt cache entry");
            Ok::<(), BlazeError>(())
        });
    }

    fn put_options<T>(&self, key: &str, envelope: &CacheEnvelope<T>, now: Timestamp) -> TierPutOptions {
        TierPutOptions {
            ttl: Some(envelope.remaining_ttl(now)),
            expires_at: Some(envelope.expires_at),
            tags: envelope.tags.iter().cloned().collect(),
            category: category_of(key).map(str::to_string),
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Wrap `value` in a new envelope written now and fan it out.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: PutOptions,
    ) -> BlazeResult<FanOutOutcome> {
        let policy = options.resolve_policy(&self.config)?;
        let envelope = CacheEnvelope::new(value, self.clock.now(), &policy, options.tags);
        self.put_envelope(key, &envelope).await
    }

    /// Write `envelope` to every tier concurrently, then register its tags.
    ///
    /// Fails only when the value cannot be serialized; individual tier
    /// failures are reported in the outcome.
    pub async fn put_envelope<T: Serialize>(
        &self,
        key: &str,
        envelope: &CacheEnvelope<T>,
    ) -> BlazeResult<FanOutOutcome> {
        let payload = envelope.encode()?;
        let options = self.put_options(key, envelope, self.clock.now());
        let timeout = self.config.tier_timeout;

        let writes = self.tiers.iter().map(|tier| {
            let payload = &payload;
            let options = &options;
            async move {
                let id = tier.id();
                (id, bounded(id, "put", timeout, tier.put(key, payload, options)).await)
            }
        });

        let mut outcome = FanOutOutcome::default();
        for (id, result) in join_all(writes).await {
            match result {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    tracing::warn!(key, tier = %id, error = %e, "Tier write failed");
                    outcome.failed.push(id);
                }
            }
        }

        if outcome.any_succeeded() && !options.tags.is_empty() {
            let registered = bounded_index(
                self.tag_index.name(),
                "register_tags",
                timeout,
                self.tag_index.register(key, &options.tags),
            )
            .await;
            if let Err(e) = registered {
                tracing::warn!(
                    key,
                    index = self.tag_index.name(),
                    error = %e,
                    "Failed to register cache tags"
                );
            }
        }

        tracing::debug!(
            key,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Cache entry written"
        );
        Ok(outcome)
    }

    /// Delete `key` from every tier concurrently.
    ///
    /// Tag index entries are left in place; deleting an absent key later is
    /// a no-op.
    pub async fn delete(&self, key: &str) -> FanOutOutcome {
        let timeout = self.config.tier_timeout;
        let deletes = self.tiers.iter().map(|tier| async move {
            let id = tier.id();
            (id, bounded(id, "delete", timeout, tier.delete(key)).await)
        });

        let mut outcome = FanOutOutcome::default();
        for (id, result) in join_all(deletes).await {
            match result {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    tracing::warn!(key, tier = %id, error = %e, "Tier delete failed");
                    outcome.failed.push(id);
                }
            }
        }
        outcome
    }

    /// Delete every key registered under `tag`, then forget the tag.
    ///
    /// Returns the number of keys processed, 0 when the tag is unknown.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let timeout = self.config.tier_timeout;
        let index = self.tag_index.name();
        let lookup = bounded_index(index, "keys_for_tag", timeout, self.tag_index.keys_for(tag));
        let keys = match lookup.await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(tag, index, error = %e, "Tag lookup failed, nothing invalidated");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        join_all(keys.iter().map(|key| self.delete(key))).await;

        let removal = bounded_index(index, "remove_tag", timeout, self.tag_index.remove_tag(tag));
        if let Err(e) = removal.await {
            tracing::warn!(tag, index, error = %e, "Failed to remove tag from index");
        }

        tracing::info!(tag, keys = keys.len(), "Invalidated cache entries by tag");
        keys.len()
    }

    /// Delete every key starting with `prefix` on any tier.
    ///
    /// Returns the number of distinct keys deleted. An empty prefix matches
    /// every key.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let timeout = self.config.tier_timeout;
        let page_size = self.config.list_page_size;
        let mut keys = BTreeSet::new();

        for tier in &self.tiers {
            let id = tier.id();
            let mut cursor: Option<String> = None;
            loop {
                let page = match bounded(id, "list", timeout, tier.list(prefix, cursor.as_deref(), page_size)).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::warn!(prefix, tier = %id, error = %e, "Tier listing failed");
                        break;
                    }
                };
                keys.extend(page.keys);
                match page.cursor {
                    Some(next) if !page.complete => cursor = Some(next),
                    _ => break,
                }
            }
        }

        join_all(keys.iter().map(|key| self.delete(key))).await;

        tracing::info!(prefix, keys = keys.len(), "Invalidated cache entries by prefix");
        keys.len()
    }

    /// Ask every tier to drop entries that expired before `now`.
    pub async fn purge_expired(&self, now: Timestamp) -> PurgeReport {
        let timeout = self.config.tier_timeout;
        let mut report = PurgeReport::default();
        for tier in &self.tiers {
            let id = tier.id();
            match bounded(id, "purge_expired", timeout, tier.purge_expired(now)).await {
                Ok(purged) => report.purged += purged,
                Err(e) => {
                    tracing::warn!(tier = %id, error = %e, "Expiry purge failed");
                    report.failed.push(id);
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for TierCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers: Vec<_> = self.tiers.iter().map(|t| t.descriptor()).collect();
        f.debug_struct("TierCoordinator")
            .field("tiers", &tiers)
            .field("tag_index_durable", &self.tag_index.is_durable())
            .field("jobs", &self.jobs)
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{FastKvTier, MemoryKvNamespace};
    use blaze_core::ManualClock;
    use chrono::{TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn kv_coordinator(clock: &ManualClock) -> TierCoordinator {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let kv = MemoryKvNamespace::new(Arc::clone(&clock));
        let tier: Arc<dyn TierStore> = Arc::new(FastKvTier::new(Arc::new(kv), Duration::from_secs(1)));
        TierCoordinator::new(vec![tier], CacheConfig::default())
            .expect("valid config")
            .with_clock(clock)
    }

    #[test]
    fn test_resolve_policy() {
        let config = CacheConfig::default();
        let explicit = SwrPolicy::from_secs(60, 30).unwrap();

        let policy = PutOptions::new().with_policy(explicit).resolve_policy(&config).unwrap();
        assert_eq!(policy, explicit);

        let policy = PutOptions::new()
            .with_ttl(Duration::from_secs(60))
            .resolve_policy(&config)
            .unwrap();
        assert_eq!(policy.ttl(), Duration::from_secs(60));
        assert_eq!(policy.swr_window(), Duration::from_secs(30));

        let policy = PutOptions::new().resolve_policy(&config).unwrap();
        assert_eq!(policy.ttl(), config.default_ttl);

        let err = PutOptions::new()
            .with_ttl(Duration::from_secs(10))
            .with_swr_window(Duration::from_secs(10))
            .resolve_policy(&config);
        assert!(err.is_err());

        let policy = PutOptions::new()
            .with_preset(TtlPreset::LiveScores)
            .resolve_policy(&config)
            .unwrap();
        assert_eq!(policy.ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CacheConfig::default().with_tier_timeout(Duration::ZERO);
        assert!(TierCoordinator::new(Vec::new(), config).is_err());
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let clock = ManualClock::new(t0());
        let coordinator = kv_coordinator(&clock);

        let outcome = coordinator
            .put("bsi:mlb:game:1", &vec![1, 2, 3], PutOptions::new().with_tags(["mlb"]))
            .await
            .expect("put");
        assert_eq!(outcome.succeeded, vec![TierId::FastKv]);

        let (value, tier) = coordinator.get::<Vec<i32>>("bsi:mlb:game:1").await.expect("hit");
        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(tier, TierId::FastKv);
        assert!(coordinator.contains("bsi:mlb:game:1").await);
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let clock = ManualClock::new(t0());
        let coordinator = kv_coordinator(&clock);
        coordinator
            .put(
                "k",
                &"v",
                PutOptions::new().with_policy(SwrPolicy::from_secs(60, 30).unwrap()),
            )
            .await
            .expect("put");

        clock.advance(Duration::from_secs(60));
        assert!(coordinator.get::<String>("k").await.is_none());
    }

    #[tokio::test]
    async fn test_type_mismatch_misses_without_purge() {
        let clock = ManualClock::new(t0());
        let coordinator = kv_coordinator(&clock);
        coordinator.put("k", &"text", PutOptions::new()).await.expect("put");

        assert!(coordinator.get::<u64>("k").await.is_none());
        coordinator.flush().await;
        assert_eq!(coordinator.jobs().snapshot().corrupt_purge.spawned, 0);
        assert!(coordinator.get::<String>("k").await.is_some());
    }

    #[tokio::test]
    async fn test_zero_tiers_is_pass_through() {
        let coordinator = TierCoordinator::new(Vec::new(), CacheConfig::default()).expect("config");
        let outcome = coordinator
            .put("k", &1u8, PutOptions::new().with_tags(["t"]))
            .await
            .expect("put");
        assert_eq!(outcome, FanOutOutcome::default());
        assert!(coordinator.get::<u8>("k").await.is_none());
        assert_eq!(coordinator.delete("k").await, FanOutOutcome::default());
        assert_eq!(coordinator.invalidate_by_tag("t").await, 0);
        assert_eq!(coordinator.invalidate_prefix("").await, 0);
    }

    #[tokio::test]
    async fn test_disabled_tiers_are_skipped() {
        let clock = ManualClock::new(t0());
        let kv = MemoryKvNamespace::new(Arc::new(clock.clone()));
        let tier: Arc<dyn TierStore> = Arc::new(FastKvTier::new(Arc::new(kv), Duration::from_secs(1)));
        let config = CacheConfig::default().with_enabled_tiers([TierId::Queryable]);
        let coordinator = TierCoordinator::new(vec![tier], config).expect("config");
        assert!(coordinator.tiers().is_empty());
        assert!(coordinator.tier(TierId::FastKv).is_none());
    }
}
