//! Blaze Core - Cache Data Types
//!
//! Envelopes, keys, freshness policy, configuration and errors shared by the
//! tiered cache. This crate holds no I/O; tiers and coordination live in
//! `blaze-cache`.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod key;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, SwrPolicy, TtlPreset, MAX_TTL};
pub use envelope::{
    CacheEnvelope, CorruptEnvelope, Freshness, TierDescriptor, TierId, ENVELOPE_VERSION,
};
pub use error::{BlazeError, BlazeResult, ConfigError, FetchError, TierError};
pub use key::{category_of, CacheKey, CacheKeyBuilder, KEY_SEPARATOR};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Add a std duration to a timestamp, saturating at the maximum
/// representable instant.
pub fn add_duration(ts: Timestamp, duration: Duration) -> Timestamp {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
