//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, TierId};

const DEFAULT_TTL_SECS: u64 = 900;
const DEFAULT_SWR_WINDOW_SECS: u64 = 120;
const DEFAULT_TIER_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_BACKGROUND_JOBS: usize = 64;
const DEFAULT_WARM_CONCURRENCY: usize = 5;
const DEFAULT_KV_MIN_TTL_SECS: u64 = 60;
const DEFAULT_KEY_PREFIX: &str = "bsi";
const DEFAULT_LIST_PAGE_SIZE: usize = 1000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Longest TTL a policy accepts (ten years). Envelope timestamps stay
/// well inside chrono's range, so `stale_at < expires_at` always holds.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// ============================================================================
// SWR POLICY
// ============================================================================

/// Validity window of an entry: total TTL and the trailing stale window.
///
/// The only way to build one is through [`SwrPolicy::new`], which enforces
/// `0 < swr_window < ttl <= MAX_TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SwrPolicy {
    ttl: Duration,
    swr_window: Duration,
}

impl SwrPolicy {
    pub fn new(ttl: Duration, swr_window: Duration) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", ttl, "ttl must be positive"));
        }
        if ttl > MAX_TTL {
            return Err(ConfigError::invalid(
                "ttl",
                ttl,
                format!("ttl must not exceed {:?}", MAX_TTL),
            ));
        }
        if swr_window.is_zero() {
            return Err(ConfigError::invalid(
                "swr_window",
                swr_window,
                "swr_window must be positive",
            ));
        }
        if swr_window >= ttl {
            return Err(ConfigError::invalid(
                "swr_window",
                swr_window,
                format!("swr_window must be strictly less than ttl ({:?})", ttl),
            ));
        }
        Ok(Self { ttl, swr_window })
    }

    pub fn from_secs(ttl_secs: u64, swr_window_secs: u64) -> Result<Self, ConfigError> {
        Self::new(
            Duration::from_secs(ttl_secs),
            Duration::from_secs(swr_window_secs),
        )
    }

    /// Policy for `ttl` with a stale window derived from `preferred_window`.
    ///
    /// Falls back to half the TTL when the preferred window does not fit.
    pub fn for_ttl(ttl: Duration, preferred_window: Duration) -> Result<Self, ConfigError> {
        if !preferred_window.is_zero() && preferred_window < ttl {
            return Self::new(ttl, preferred_window);
        }
        Self::new(ttl, ttl / 2)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn swr_window(&self) -> Duration {
        self.swr_window
    }

    /// Portion of the TTL during which an entry is fresh.
    pub fn fresh_for(&self) -> Duration {
        self.ttl - self.swr_window
    }
}

impl<'de> Deserialize<'de> for SwrPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            ttl: Duration,
            swr_window: Duration,
        }

        let raw = Raw::deserialize(deserializer)?;
        SwrPolicy::new(raw.ttl, raw.swr_window).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// TTL PRESETS
// ============================================================================

/// Named freshness policies for the data categories the platform serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlPreset {
    /// In-progress game scores (30s, 10s stale window)
    LiveScores,
    /// Conference and league standings (5m, 1m)
    Standings,
    /// Team rosters and portal entries (1h, 10m)
    Rosters,
    /// Polls and power rankings (1h, 15m)
    Rankings,
    /// NIL and fair-market valuations (6h, 1h)
    Valuations,
    /// Reference data such as teams and venues (24h, 6h)
    Reference,
    /// Caller-supplied policy
    Custom(SwrPolicy),
}

impl TtlPreset {
    pub fn policy(&self) -> SwrPolicy {
        let (ttl, swr_window) = match self {
            Self::LiveScores => (30, 10),
            Self::Standings => (300, 60),
            Self::Rosters => (3600, 600),
            Self::Rankings => (3600, 900),
            Self::Valuations => (21_600, 3600),
            Self::Reference => (86_400, 21_600),
            Self::Custom(policy) => return *policy,
        };
        SwrPolicy {
            ttl: Duration::from_secs(ttl),
            swr_window: Duration::from_secs(swr_window),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.policy().ttl()
    }
}

impl From<TtlPreset> for SwrPolicy {
    fn from(preset: TtlPreset) -> Self {
        preset.policy()
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Runtime configuration of the tiered cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a write does not specify one.
    pub default_ttl: Duration,
    /// Stale window applied when a write does not specify one.
    pub default_swr_window: Duration,
    /// Upper bound on any single tier call.
    pub tier_timeout: Duration,
    /// Maximum detached background jobs (promotion, revalidation) in flight.
    pub max_background_jobs: usize,
    /// Default batch size for cache warming.
    pub warm_concurrency: usize,
    /// Smallest native TTL the fast KV tier accepts.
    pub kv_min_ttl: Duration,
    /// Leading namespace segment for generated keys.
    pub key_prefix: String,
    /// Page size for prefix listings.
    pub list_page_size: usize,
    /// How often tiers without native TTL are swept for expired rows.
    pub sweep_interval: Duration,
    /// Tiers enabled in this deployment, in lookup order.
    pub enabled_tiers: Vec<TierId>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            default_swr_window: Duration::from_secs(DEFAULT_SWR_WINDOW_SECS),
            tier_timeout: Duration::from_millis(DEFAULT_TIER_TIMEOUT_MS),
            max_background_jobs: DEFAULT_MAX_BACKGROUND_JOBS,
            warm_concurrency: DEFAULT_WARM_CONCURRENCY,
            kv_min_ttl: Duration::from_secs(DEFAULT_KV_MIN_TTL_SECS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            enabled_tiers: TierId::ALL.to_vec(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_tier(name: &str) -> Option<TierId> {
    match name.trim().to_ascii_lowercase().as_str() {
        "kv" | "fast_kv" => Some(TierId::FastKv),
        "r2" | "object" | "durable_object" => Some(TierId::DurableObject),
        "d1" | "sql" | "queryable" => Some(TierId::Queryable),
        _ => None,
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build configuration from `BLAZE_CACHE_*` environment variables.
    ///
    /// # Environment Variables
    /// - `BLAZE_CACHE_DEFAULT_TTL_SECS` (default: 900)
    /// - `BLAZE_CACHE_SWR_WINDOW_SECS` (default: 120)
    /// - `BLAZE_CACHE_TIER_TIMEOUT_MS` (default: 1000)
    /// - `BLAZE_CACHE_MAX_BACKGROUND_JOBS` (default: 64)
    /// - `BLAZE_CACHE_WARM_CONCURRENCY` (default: 5)
    /// - `BLAZE_CACHE_KV_MIN_TTL_SECS` (default: 60)
    /// - `BLAZE_CACHE_KEY_PREFIX` (default: "bsi")
    /// - `BLAZE_CACHE_LIST_PAGE_SIZE` (default: 1000)
    /// - `BLAZE_CACHE_SWEEP_INTERVAL_SECS` (default: 300)
    /// - `BLAZE_CACHE_TIERS`: comma separated subset of `kv,r2,d1` (default: all)
    pub fn from_env() -> Self {
        let enabled_tiers = std::env::var("BLAZE_CACHE_TIERS")
            .ok()
            .map(|s| {
                let mut tiers: Vec<TierId> = s.split(',').filter_map(parse_tier).collect();
                tiers.sort();
                tiers.dedup();
                tiers
            })
            .unwrap_or_else(|| TierId::ALL.to_vec());

        Self {
            default_ttl: Duration::from_secs(
                env_parse("BLAZE_CACHE_DEFAULT_TTL_SECS").unwrap_or(DEFAULT_TTL_SECS),
            ),
            default_swr_window: Duration::from_secs(
                env_parse("BLAZE_CACHE_SWR_WINDOW_SECS").unwrap_or(DEFAULT_SWR_WINDOW_SECS),
            ),
            tier_timeout: Duration::from_millis(
                env_parse("BLAZE_CACHE_TIER_TIMEOUT_MS").unwrap_or(DEFAULT_TIER_TIMEOUT_MS),
            ),
            max_background_jobs: env_parse("BLAZE_CACHE_MAX_BACKGROUND_JOBS")
                .unwrap_or(DEFAULT_MAX_BACKGROUND_JOBS),
            warm_concurrency: env_parse("BLAZE_CACHE_WARM_CONCURRENCY")
                .unwrap_or(DEFAULT_WARM_CONCURRENCY),
            kv_min_ttl: Duration::from_secs(
                env_parse("BLAZE_CACHE_KV_MIN_TTL_SECS").unwrap_or(DEFAULT_KV_MIN_TTL_SECS),
            ),
            key_prefix: std::env::var("BLAZE_CACHE_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            list_page_size: env_parse("BLAZE_CACHE_LIST_PAGE_SIZE")
                .unwrap_or(DEFAULT_LIST_PAGE_SIZE),
            sweep_interval: Duration::from_secs(
                env_parse("BLAZE_CACHE_SWEEP_INTERVAL_SECS")
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            enabled_tiers,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_swr_window(mut self, window: Duration) -> Self {
        self.default_swr_window = window;
        self
    }

    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    pub fn with_max_background_jobs(mut self, max: usize) -> Self {
        self.max_background_jobs = max;
        self
    }

    pub fn with_warm_concurrency(mut self, concurrency: usize) -> Self {
        self.warm_concurrency = concurrency;
        self
    }

    pub fn with_kv_min_ttl(mut self, ttl: Duration) -> Self {
        self.kv_min_ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_enabled_tiers(mut self, tiers: impl IntoIterator<Item = TierId>) -> Self {
        self.enabled_tiers = tiers.into_iter().collect();
        self
    }

    pub fn is_tier_enabled(&self, tier: TierId) -> bool {
        self.enabled_tiers.contains(&tier)
    }

    /// The policy applied to writes that do not carry their own.
    pub fn default_policy(&self) -> Result<SwrPolicy, ConfigError> {
        SwrPolicy::new(self.default_ttl, self.default_swr_window)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - the default TTL / stale window form a valid [`SwrPolicy`]
    /// - tier timeout and sweep interval are positive
    /// - background job capacity, warm concurrency and page size are non-zero
    /// - the key prefix is non-empty and contains no `:`
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_policy()?;

        if self.tier_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "tier_timeout",
                self.tier_timeout,
                "tier_timeout must be positive",
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "sweep_interval",
                self.sweep_interval,
                "sweep_interval must be positive",
            ));
        }

        if self.max_background_jobs == 0 {
            return Err(ConfigError::invalid(
                "max_background_jobs",
                self.max_background_jobs,
                "max_background_jobs must be greater than 0",
            ));
        }

        if self.warm_concurrency == 0 {
            return Err(ConfigError::invalid(
                "warm_concurrency",
                self.warm_concurrency,
                "warm_concurrency must be greater than 0",
            ));
        }

        if self.list_page_size == 0 {
            return Err(ConfigError::invalid(
                "list_page_size",
                self.list_page_size,
                "list_page_size must be greater than 0",
            ));
        }

        if self.key_prefix.is_empty() || self.key_prefix.contains(':') {
            return Err(ConfigError::invalid(
                "key_prefix",
                &self.key_prefix,
                "key_prefix must be non-empty and must not contain ':'",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_swr_policy_rejects_window_not_below_ttl() {
        assert!(SwrPolicy::from_secs(60, 60).is_err());
        assert!(SwrPolicy::from_secs(60, 90).is_err());
        assert!(SwrPolicy::from_secs(0, 0).is_err());
        assert!(SwrPolicy::from_secs(60, 0).is_err());

        let policy = SwrPolicy::from_secs(60, 30).expect("valid");
        assert_eq!(policy.ttl(), Duration::from_secs(60));
        assert_eq!(policy.swr_window(), Duration::from_secs(30));
        assert_eq!(policy.fresh_for(), Duration::from_secs(30));
    }

    #[test]
    fn test_swr_policy_rejects_ttl_above_ceiling() {
        assert!(SwrPolicy::new(MAX_TTL, Duration::from_secs(60)).is_ok());

        let err = SwrPolicy::new(MAX_TTL + Duration::from_secs(1), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "ttl"));

        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(SwrPolicy::new(huge, Duration::from_secs(60)).is_err());
        assert!(SwrPolicy::for_ttl(huge, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_default_ttl() {
        let config = CacheConfig::new().with_ttl(Duration::from_secs(u64::MAX / 2));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ttl"
        ));
    }

    #[test]
    fn test_swr_policy_for_ttl_falls_back_to_half() {
        let policy =
            SwrPolicy::for_ttl(Duration::from_secs(60), Duration::from_secs(120)).expect("valid");
        assert_eq!(policy.swr_window(), Duration::from_secs(30));

        let policy =
            SwrPolicy::for_ttl(Duration::from_secs(600), Duration::from_secs(120)).expect("valid");
        assert_eq!(policy.swr_window(), Duration::from_secs(120));
    }

    #[test]
    fn test_swr_policy_deserialize_validates() {
        let ok = r#"{"ttl":{"secs":60,"nanos":0},"swr_window":{"secs":10,"nanos":0}}"#;
        assert!(serde_json::from_str::<SwrPolicy>(ok).is_ok());

        let bad = r#"{"ttl":{"secs":60,"nanos":0},"swr_window":{"secs":60,"nanos":0}}"#;
        assert!(serde_json::from_str::<SwrPolicy>(bad).is_err());
    }

    #[test]
    fn test_presets_are_valid_policies() {
        let presets = [
            TtlPreset::LiveScores,
            TtlPreset::Standings,
            TtlPreset::Rosters,
            TtlPreset::Rankings,
            TtlPreset::Valuations,
            TtlPreset::Reference,
        ];
        for preset in presets {
            let policy = preset.policy();
            assert!(
                SwrPolicy::new(policy.ttl(), policy.swr_window()).is_ok(),
                "{:?} must be a valid policy",
                preset
            );
        }
        assert_eq!(TtlPreset::LiveScores.ttl(), Duration::from_secs(30));

        let custom = SwrPolicy::from_secs(10, 5).expect("valid");
        assert_eq!(TtlPreset::Custom(custom).policy(), custom);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_ttl, Duration::from_secs(900));
        assert_eq!(config.enabled_tiers, TierId::ALL.to_vec());
        assert!(config.is_tier_enabled(TierId::Queryable));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_secs(120))
            .with_swr_window(Duration::from_secs(20))
            .with_tier_timeout(Duration::from_millis(50))
            .with_max_background_jobs(4)
            .with_warm_concurrency(2)
            .with_kv_min_ttl(Duration::from_secs(1))
            .with_key_prefix("test")
            .with_enabled_tiers([TierId::FastKv]);

        assert!(config.validate().is_ok());
        assert_eq!(config.tier_timeout, Duration::from_millis(50));
        assert_eq!(config.max_background_jobs, 4);
        assert_eq!(config.key_prefix, "test");
        assert!(!config.is_tier_enabled(TierId::DurableObject));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let swr_too_big = CacheConfig::new().with_swr_window(Duration::from_secs(900));
        assert!(swr_too_big.validate().is_err());

        let zero_timeout = CacheConfig::new().with_tier_timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let zero_jobs = CacheConfig::new().with_max_background_jobs(0);
        assert!(zero_jobs.validate().is_err());

        let bad_prefix = CacheConfig::new().with_key_prefix("a:b");
        assert!(bad_prefix.validate().is_err());
    }

    #[test]
    fn test_parse_tier_aliases() {
        assert_eq!(parse_tier("kv"), Some(TierId::FastKv));
        assert_eq!(parse_tier(" R2 "), Some(TierId::DurableObject));
        assert_eq!(parse_tier("d1"), Some(TierId::Queryable));
        assert_eq!(parse_tier("redis"), None);
    }

    proptest! {
        #[test]
        fn prop_swr_window_must_be_below_ttl(ttl in 0u64..100_000, swr in 0u64..100_000) {
            let result = SwrPolicy::from_secs(ttl, swr);
            prop_assert_eq!(result.is_ok(), ttl > 0 && swr > 0 && swr < ttl);
        }

        #[test]
        fn prop_ttl_ceiling(ttl in 1u64..u64::MAX) {
            let result = SwrPolicy::new(Duration::from_secs(ttl), Duration::from_nanos(1));
            prop_assert_eq!(result.is_ok(), Duration::from_secs(ttl) <= MAX_TTL);
        }
    }
}
