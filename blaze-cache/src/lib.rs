//! Blaze Cache - Tiered Cache Coordination
//!
//! Unifies a fast key-value store, durable object storage and a queryable
//! relational store behind one lookup/write contract:
//! - Waterfall reads with promotion into faster tiers
//! - Fan-out writes and deletes tolerating partial failure
//! - Tag and prefix invalidation
//! - Stale-while-revalidate reads with single-flight origin fetches
//! - Bounded-concurrency cache warming
//! - Online per-tier metrics with pluggable telemetry sinks
//!
//! Tier failures never surface to callers; they are logged and treated as
//! misses.

pub mod coordinator;
pub mod jobs;
pub mod metrics;
pub mod sweeper;
pub mod swr;
pub mod tag_index;
pub mod telemetry;
pub mod tier;
pub mod warmer;

// Re-export commonly used types
pub use coordinator::{FanOutOutcome, PurgeReport, PutOptions, TierCoordinator};
pub use jobs::{BackgroundJobs, JobCounts, JobKind, JobsSnapshot};
pub use metrics::{
    DataPoint, MetricsCollector, MetricsSnapshot, PrometheusTelemetrySink, SwrCounts,
    TelemetrySink, TierMetrics, TracingTelemetrySink,
};
pub use sweeper::{expiry_sweep_task, sweep_once, SweepConfig, SweepMetrics, SweepSnapshot};
pub use swr::{SwrEngine, SwrOptions, SwrRead};
pub use tag_index::{InMemoryTagIndex, QueryableTagIndex, TagIndex, TagIndexError};
pub use telemetry::{init_tracing, TelemetryError, TracingConfig};
pub use tier::{
    bounded, BindingError, CacheRow, CacheTable, DurableObjectTier, FastKvTier, KvNamespace,
    ListPage, LmdbObjectBucket, MemoryKvNamespace, ObjectBucket, PgCacheTable, PostgresConfig,
    QueryableTier, TierPutOptions, TierStore,
};
pub use warmer::{CacheWarmer, WarmOptions, WarmReport, WarmerStats};
