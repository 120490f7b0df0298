//! Cache envelopes and tier descriptors.
//!
//! A [`CacheEnvelope`] is the unit every tier stores: the value plus the
//! timestamps the freshness policy is evaluated against. Envelopes are
//! immutable once built; a new `put` for the same key replaces the whole
//! envelope.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::SwrPolicy;
use crate::{add_duration, Timestamp};

/// Schema version written into every envelope.
///
/// Payloads carrying any other version are treated as corrupt.
pub const ENVELOPE_VERSION: u32 = 1;

// ============================================================================
// TIERS
// ============================================================================

/// Identity of a backing tier.
///
/// The declaration order is the default lookup order: fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierId {
    /// Fast ephemeral key-value store with native TTL.
    FastKv,
    /// Durable object storage without native TTL.
    DurableObject,
    /// Queryable relational storage without native TTL.
    Queryable,
}

impl TierId {
    /// All tiers in default priority order.
    pub const ALL: [TierId; 3] = [TierId::FastKv, TierId::DurableObject, TierId::Queryable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastKv => "fast_kv",
            Self::DurableObject => "durable_object",
            Self::Queryable => "queryable",
        }
    }

    /// Default lookup priority (lower is consulted first).
    pub fn default_priority(&self) -> u8 {
        match self {
            Self::FastKv => 0,
            Self::DurableObject => 1,
            Self::Queryable => 2,
        }
    }

    /// Whether the backing store expires entries on its own.
    pub fn has_native_ttl(&self) -> bool {
        matches!(self, Self::FastKv)
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position and availability of a tier in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierDescriptor {
    pub id: TierId,
    pub priority: u8,
    pub present: bool,
}

impl TierDescriptor {
    /// A present tier at its default priority.
    pub fn new(id: TierId) -> Self {
        Self {
            id,
            priority: id.default_priority(),
            present: true,
        }
    }

    /// A tier that is not bound in this deployment. It is skipped, never
    /// treated as failing.
    pub fn absent(id: TierId) -> Self {
        Self {
            present: false,
            ..Self::new(id)
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

// ============================================================================
// FRESHNESS
// ============================================================================

/// Classification of an entry at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// `now < stale_at`: serve, never fetch.
    Fresh,
    /// `stale_at <= now < expires_at`: serve, revalidate in the background.
    Stale,
    /// `now >= expires_at` or absent: fetch before answering.
    Miss,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Miss => "miss",
        }
    }

    /// True for classes that can be served from cache.
    pub fn is_servable(&self) -> bool {
        !matches!(self, Self::Miss)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Payload could not be interpreted as an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Corrupt cache envelope: {reason}")]
pub struct CorruptEnvelope {
    pub reason: String,
}

/// Versioned, timestamped wrapper around a cached value.
///
/// Invariant: `cached_at <= stale_at < expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub version: u32,
    pub value: T,
    pub cached_at: Timestamp,
    pub stale_at: Timestamp,
    pub expires_at: Timestamp,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Tier the envelope was read from. Filled in on read, never persisted.
    #[serde(skip)]
    pub source_tier: Option<TierId>,
}

impl<T> CacheEnvelope<T> {
    /// Build a new envelope written at `now` under `policy`.
    pub fn new<I, S>(value: T, now: Timestamp, policy: &SwrPolicy, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expires_at = add_duration(now, policy.ttl());
        let stale_at = add_duration(now, policy.fresh_for());
        Self {
            version: ENVELOPE_VERSION,
            value,
            cached_at: now,
            stale_at,
            expires_at,
            tags: tags.into_iter().map(Into::into).collect(),
            source_tier: None,
        }
    }

    /// Classify this entry against `now`.
    pub fn classify(&self, now: Timestamp) -> Freshness {
        if now >= self.expires_at {
            Freshness::Miss
        } else if now >= self.stale_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: Timestamp) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// How long ago this envelope was written.
    pub fn age(&self, now: Timestamp) -> Duration {
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Copy of this envelope annotated with the tier it was read from.
    pub fn with_source_tier(mut self, tier: TierId) -> Self {
        self.source_tier = Some(tier);
        self
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Map the inner value, keeping all metadata.
    pub fn map<U, F>(self, f: F) -> CacheEnvelope<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheEnvelope {
            version: self.version,
            value: f(self.value),
            cached_at: self.cached_at,
            stale_at: self.stale_at,
            expires_at: self.expires_at,
            tags: self.tags,
            source_tier: self.source_tier,
        }
    }
}

impl<T: Serialize> CacheEnvelope<T> {
    /// Serialize for storage in a tier.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> CacheEnvelope<T> {
    /// Parse a stored payload, rejecting unknown versions and broken
    /// timestamp ordering.
    pub fn decode(bytes: &[u8]) -> Result<Self, CorruptEnvelope> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(|e| CorruptEnvelope {
            reason: e.to_string(),
        })?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(CorruptEnvelope {
                reason: format!(
                    "unsupported envelope version {} (expected {})",
                    envelope.version, ENVELOPE_VERSION
                ),
            });
        }

        if envelope.cached_at > envelope.stale_at || envelope.stale_at >= envelope.expires_at {
            return Err(CorruptEnvelope {
                reason: "timestamps out of order".to_string(),
            });
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn policy(ttl: u64, swr: u64) -> SwrPolicy {
        SwrPolicy::from_secs(ttl, swr).expect("valid policy")
    }

    #[test]
    fn test_envelope_timestamps() {
        let env = CacheEnvelope::new(3, t0(), &policy(60, 30), ["live"]);
        assert_eq!(env.cached_at, t0());
        assert_eq!(env.stale_at, t0() + secs(30));
        assert_eq!(env.expires_at, t0() + secs(60));
        assert!(env.tags.contains("live"));
        assert_eq!(env.version, ENVELOPE_VERSION);
        assert!(env.source_tier.is_none());
    }

    #[test]
    fn test_classify_boundaries() {
        let env = CacheEnvelope::new("v", t0(), &policy(60, 30), Vec::<String>::new());
        assert_eq!(env.classify(t0()), Freshness::Fresh);
        assert_eq!(env.classify(t0() + secs(29)), Freshness::Fresh);
        assert_eq!(env.classify(t0() + secs(30)), Freshness::Stale);
        assert_eq!(env.classify(t0() + secs(59)), Freshness::Stale);
        assert_eq!(env.classify(t0() + secs(60)), Freshness::Miss);
        assert!(env.is_expired(t0() + secs(60)));
    }

    #[test]
    fn test_remaining_ttl_and_age() {
        let env = CacheEnvelope::new(1u8, t0(), &policy(60, 10), Vec::<String>::new());
        assert_eq!(env.remaining_ttl(t0() + secs(15)), Duration::from_secs(45));
        assert_eq!(env.remaining_ttl(t0() + secs(90)), Duration::ZERO);
        assert_eq!(env.age(t0() + secs(15)), Duration::from_secs(15));
    }

    #[test]
    fn test_source_tier_not_persisted() {
        let env = CacheEnvelope::new("x".to_string(), t0(), &policy(60, 10), ["a"])
            .with_source_tier(TierId::Queryable);
        let bytes = env.encode().expect("encode");
        let decoded = CacheEnvelope::<String>::decode(&bytes).expect("decode");
        assert_eq!(decoded.source_tier, None);
        assert_eq!(decoded.value, "x");
        assert_eq!(decoded.tags, env.tags);
    }

    #[test]
    fn test_decode_rejects_garbage_and_versions() {
        assert!(CacheEnvelope::<u32>::decode(b"{not json").is_err());

        let mut env = CacheEnvelope::new(7u32, t0(), &policy(60, 10), Vec::<String>::new());
        env.version = ENVELOPE_VERSION + 1;
        let bytes = env.encode().expect("encode");
        let err = CacheEnvelope::<u32>::decode(&bytes).unwrap_err();
        assert!(err.reason.contains("version"));
    }

    #[test]
    fn test_decode_rejects_out_of_order_timestamps() {
        let mut env = CacheEnvelope::new(7u32, t0(), &policy(60, 10), Vec::<String>::new());
        env.stale_at = env.expires_at;
        let bytes = env.encode().expect("encode");
        assert!(CacheEnvelope::<u32>::decode(&bytes).is_err());
    }

    #[test]
    fn test_longest_policy_round_trips() {
        let longest = SwrPolicy::new(crate::config::MAX_TTL, Duration::from_secs(60))
            .expect("ceiling is accepted");
        let env = CacheEnvelope::new(7u32, t0(), &longest, Vec::<String>::new());
        assert!(env.stale_at < env.expires_at);

        let bytes = env.encode().expect("encode");
        let decoded = CacheEnvelope::<u32>::decode(&bytes).expect("decodes");
        assert_eq!(decoded.expires_at, env.expires_at);
        assert_eq!(decoded.classify(t0()), Freshness::Fresh);
    }

    #[test]
    fn test_tier_order_and_descriptors() {
        let mut tiers = vec![TierId::Queryable, TierId::FastKv, TierId::DurableObject];
        tiers.sort();
        assert_eq!(tiers, TierId::ALL.to_vec());
        assert!(TierId::FastKv.has_native_ttl());
        assert!(!TierId::DurableObject.has_native_ttl());

        let absent = TierDescriptor::absent(TierId::Queryable);
        assert!(!absent.present);
        assert_eq!(absent.priority, 2);
        assert_eq!(TierDescriptor::new(TierId::FastKv).with_priority(9).priority, 9);
    }

    proptest! {
        #[test]
        fn prop_classification_is_monotonic(ttl in 2u64..10_000, swr_frac in 0.0f64..0.99, a in 0i64..20_000, b in 0i64..20_000) {
            let swr = 1 + (((ttl - 1) as f64) * swr_frac) as u64;
            let env = CacheEnvelope::new((), t0(), &policy(ttl, swr), Vec::<String>::new());
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let rank = |f: Freshness| match f {
                Freshness::Fresh => 0,
                Freshness::Stale => 1,
                Freshness::Miss => 2,
            };
            prop_assert!(rank(env.classify(t0() + secs(early))) <= rank(env.classify(t0() + secs(late))));
        }

        #[test]
        fn prop_envelope_invariant_holds(ttl in 2u64..1_000_000, swr_frac in 0.0f64..0.999) {
            let swr = 1 + (((ttl - 1) as f64) * swr_frac) as u64;
            let env = CacheEnvelope::new(0u8, t0(), &policy(ttl, swr), Vec::<String>::new());
            prop_assert!(env.cached_at <= env.stale_at);
            prop_assert!(env.stale_at < env.expires_at);
        }
    }
}
