//! Cache metrics.
//!
//! [`MetricsCollector`] keeps per-tier hit/miss counts and a running
//! average latency without storing samples:
//!
//! ```text
//! avg' = total == 1 ? latency : (avg * (total - 1) + latency) / total
//! ```
//!
//! [`MetricsCollector::record_metrics`] emits one [`DataPoint`] to the
//! configured [`TelemetrySink`]. Sinks must not block.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use blaze_core::{Freshness, TierId};
use once_cell::sync::Lazy;
use prometheus::{register_gauge_vec_with_registry, GaugeVec, Registry};
use serde::Serialize;

/// Index written on every data point.
pub const DATA_POINT_INDEX: &str = "blaze_cache";

/// Values recorded per tier in a data point: hits, misses, avg latency.
const VALUES_PER_TIER: usize = 3;

// ============================================================================
// PER-TIER METRICS
// ============================================================================

/// Counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TierMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Running average lookup latency in milliseconds.
    pub avg_latency_ms: f64,
}

impl TierMetrics {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn record(&mut self, hit: bool, latency_ms: f64) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        let total = self.total();
        self.avg_latency_ms = if total == 1 {
            latency_ms
        } else {
            (self.avg_latency_ms * (total - 1) as f64 + latency_ms) / total as f64
        };
    }
}

/// Stale-while-revalidate outcome counters.
#[derive(Debug, Default)]
struct SwrCounters {
    fresh: AtomicU64,
    stale: AtomicU64,
    miss: AtomicU64,
    forced: AtomicU64,
    refreshed: AtomicU64,
    fetch_errors: AtomicU64,
}

/// Snapshot of SWR outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwrCounts {
    pub fresh: u64,
    pub stale: u64,
    pub miss: u64,
    pub forced: u64,
    pub refreshed: u64,
    pub fetch_errors: u64,
}

/// Point-in-time view of all cache metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tiers: BTreeMap<TierId, TierMetrics>,
    pub swr: SwrCounts,
}

impl MetricsSnapshot {
    pub fn tier(&self, id: TierId) -> TierMetrics {
        self.tiers.get(&id).copied().unwrap_or_default()
    }

    /// Fraction of lookups answered by any tier.
    ///
    /// A waterfall read that misses in the fast tier and hits in a slower
    /// one counts one miss and one hit, so this is measured per lookup
    /// attempt rather than per request.
    pub fn overall_hit_rate(&self) -> f64 {
        let (hits, total) = self
            .tiers
            .values()
            .fold((0u64, 0u64), |(h, t), m| (h + m.hits, t + m.total()));
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// A telemetry data point: string indexes, string blobs and numbers.
///
/// Layout: `blobs[i]` names the i-th tier that has recorded a lookup, in
/// `TierId` order (fast KV, durable object, queryable) whatever the
/// coordinator's lookup priority; `doubles[3i..3i+3]` hold its hits, misses
/// and average latency; the final double is the overall hit rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataPoint {
    pub indexes: Vec<String>,
    pub blobs: Vec<String>,
    pub doubles: Vec<f64>,
}

impl DataPoint {
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        let mut blobs = Vec::with_capacity(snapshot.tiers.len());
        let mut doubles = Vec::with_capacity(snapshot.tiers.len() * VALUES_PER_TIER + 1);
        for (tier, metrics) in &snapshot.tiers {
            blobs.push(tier.as_str().to_string());
            doubles.push(metrics.hits as f64);
            doubles.push(metrics.misses as f64);
            doubles.push(metrics.avg_latency_ms);
        }
        doubles.push(snapshot.overall_hit_rate());
        Self {
            indexes: vec![DATA_POINT_INDEX.to_string()],
            blobs,
            doubles,
        }
    }

    /// Per-tier `(tier, hits, misses, avg_latency_ms)` rows.
    pub fn tier_rows(&self) -> impl Iterator<Item = (&str, f64, f64, f64)> + '_ {
        self.blobs
            .iter()
            .zip(self.doubles.chunks_exact(VALUES_PER_TIER))
            .map(|(tier, values)| (tier.as_str(), values[0], values[1], values[2]))
    }

    pub fn overall_hit_rate(&self) -> Option<f64> {
        if self.doubles.len() == self.blobs.len() * VALUES_PER_TIER + 1 {
            self.doubles.last().copied()
        } else {
            None
        }
    }
}

/// Destination for metric data points. Writes are fire-and-forget.
pub trait TelemetrySink: Send + Sync {
    fn write_data_point(&self, point: DataPoint);
}

/// Sink that logs each data point through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn write_data_point(&self, point: DataPoint) {
        for (tier, hits, misses, avg_latency_ms) in point.tier_rows() {
            tracing::info!(tier, hits, misses, avg_latency_ms, "Cache tier metrics");
        }
        tracing::info!(
            overall_hit_rate = point.overall_hit_rate().unwrap_or(0.0),
            "Cache metrics recorded"
        );
    }
}

/// Sink that mirrors data points into Prometheus gauges.
#[derive(Clone)]
pub struct PrometheusTelemetrySink {
    registry: Registry,
    tier_hits: GaugeVec,
    tier_misses: GaugeVec,
    tier_latency_ms: GaugeVec,
    hit_rate: GaugeVec,
}

/// Sink registered with the process-wide default registry.
pub static PROMETHEUS_SINK: Lazy<Result<PrometheusTelemetrySink, prometheus::Error>> =
    Lazy::new(|| PrometheusTelemetrySink::new(prometheus::default_registry()));

impl PrometheusTelemetrySink {
    /// Create and register the cache gauges with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            registry: registry.clone(),
            tier_hits: register_gauge_vec_with_registry!(
                "blaze_cache_tier_hits",
                "Cache hits per tier",
                &["tier"],
                registry
            )?,
            tier_misses: register_gauge_vec_with_registry!(
                "blaze_cache_tier_misses",
                "Cache misses per tier",
                &["tier"],
                registry
            )?,
            tier_latency_ms: register_gauge_vec_with_registry!(
                "blaze_cache_tier_avg_latency_ms",
                "Running average lookup latency per tier in milliseconds",
                &["tier"],
                registry
            )?,
            hit_rate: register_gauge_vec_with_registry!(
                "blaze_cache_hit_rate",
                "Overall cache hit rate",
                &["index"],
                registry
            )?,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl TelemetrySink for PrometheusTelemetrySink {
    fn write_data_point(&self, point: DataPoint) {
        for (tier, hits, misses, avg_latency_ms) in point.tier_rows() {
            self.tier_hits.with_label_values(&[tier]).set(hits);
            self.tier_misses.with_label_values(&[tier]).set(misses);
            self.tier_latency_ms
                .with_label_values(&[tier])
                .set(avg_latency_ms);
        }
        if let Some(rate) = point.overall_hit_rate() {
            let index = point
                .indexes
                .first()
                .map(String::as_str)
                .unwrap_or(DATA_POINT_INDEX);
            self.hit_rate.with_label_values(&[index]).set(rate);
        }
    }
}

// ============================================================================
// COLLECTOR
// ============================================================================

/// Online metrics aggregation for the tiered cache.
#[derive(Default)]
pub struct MetricsCollector {
    tiers: RwLock<BTreeMap<TierId, TierMetrics>>,
    swr: SwrCounters,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    pub fn record_hit(&self, tier: TierId, latency: Duration) {
        self.record_lookup(tier, true, latency);
    }

    pub fn record_miss(&self, tier: TierId, latency: Duration) {
        self.record_lookup(tier, false, latency);
    }

    fn record_lookup(&self, tier: TierId, hit: bool, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.entry(tier).or_default().record(hit, latency_ms);
        }
    }

    pub fn record_freshness(&self, freshness: Freshness) {
        let counter = match freshness {
            Freshness::Fresh => &self.swr.fresh,
            Freshness::Stale => &self.swr.stale,
            Freshness::Miss => &self.swr.miss,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_refresh(&self) {
        self.swr.forced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self) {
        self.swr.refreshed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.swr.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tiers = self
            .tiers
            .read()
            .map(|t| t.clone())
            .unwrap_or_default();
        MetricsSnapshot {
            tiers,
            swr: SwrCounts {
                fresh: self.swr.fresh.load(Ordering::Relaxed),
                stale: self.swr.stale.load(Ordering::Relaxed),
                miss: self.swr.miss.load(Ordering::Relaxed),
                forced: self.swr.forced.load(Ordering::Relaxed),
                refreshed: self.swr.refreshed.load(Ordering::Relaxed),
                fetch_errors: self.swr.fetch_errors.load(Ordering::Relaxed),
            },
        }
    }

    /// Emit one data point to the telemetry sink, if one is configured.
    pub fn record_metrics(&self) -> Option<DataPoint> {
        let sink = self.sink.as_ref()?;
        let point = DataPoint::from_snapshot(&self.snapshot());
        sink.write_data_point(point.clone());
        Some(point)
    }

    /// Clear tier counters and SWR counters.
    pub fn reset(&self) {
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.clear();
        }
        for counter in [
            &self.swr.fresh,
            &self.swr.stale,
            &self.swr.miss,
            &self.swr.forced,
            &self.swr.refreshed,
            &self.swr.fetch_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("snapshot", &self.snapshot())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        points: Mutex<Vec<DataPoint>>,
    }

    impl TelemetrySink for CapturingSink {
        fn write_data_point(&self, point: DataPoint) {
            self.points.lock().unwrap().push(point);
        }
    }

    #[test]
    fn test_online_average() {
        let collector = MetricsCollector::new();
        collector.record_hit(TierId::FastKv, Duration::from_millis(10));
        collector.record_miss(TierId::FastKv, Duration::from_millis(20));
        collector.record_hit(TierId::FastKv, Duration::from_millis(30));

        let metrics = collector.snapshot().tier(TierId::FastKv);
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.avg_latency_ms - 20.0).abs() < 1e-9);
        assert!((metrics.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_hit_rate() {
        let collector = MetricsCollector::new();
        collector.record_miss(TierId::FastKv, Duration::ZERO);
        collector.record_hit(TierId::Queryable, Duration::ZERO);
        collector.record_hit(TierId::FastKv, Duration::ZERO);
        collector.record_hit(TierId::FastKv, Duration::ZERO);

        let snapshot = collector.snapshot();
        assert!((snapshot.overall_hit_rate() - 0.75).abs() < 1e-9);
        assert_eq!(MetricsSnapshot::default().overall_hit_rate(), 0.0);
    }

    #[test]
    fn test_record_metrics_emits_one_point() {
        let sink = Arc::new(CapturingSink::default());
        let collector = MetricsCollector::with_sink(sink.clone());
        collector.record_hit(TierId::DurableObject, Duration::from_millis(4));
        collector.record_miss(TierId::FastKv, Duration::from_millis(2));

        let point = collector.record_metrics().expect("sink configured");
        assert_eq!(point.indexes, vec![DATA_POINT_INDEX]);
        assert_eq!(point.blobs, vec!["fast_kv", "durable_object"]);
        assert_eq!(point.doubles.len(), 7);

        let rows: Vec<_> = point.tier_rows().collect();
        assert_eq!(rows[0], ("fast_kv", 0.0, 1.0, 2.0));
        assert_eq!(rows[1], ("durable_object", 1.0, 0.0, 4.0));
        assert_eq!(point.overall_hit_rate(), Some(0.5));

        assert_eq!(sink.points.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_record_metrics_without_sink() {
        let collector = MetricsCollector::new();
        collector.record_hit(TierId::FastKv, Duration::ZERO);
        assert!(collector.record_metrics().is_none());
    }

    #[test]
    fn test_swr_counters() {
        let collector = MetricsCollector::new();
        collector.record_freshness(Freshness::Fresh);
        collector.record_freshness(Freshness::Stale);
        collector.record_freshness(Freshness::Miss);
        collector.record_freshness(Freshness::Miss);
        collector.record_forced_refresh();
        collector.record_refresh();
        collector.record_fetch_error();

        let swr = collector.snapshot().swr;
        assert_eq!(swr.fresh, 1);
        assert_eq!(swr.stale, 1);
        assert_eq!(swr.miss, 2);
        assert_eq!(swr.forced, 1);
        assert_eq!(swr.refreshed, 1);
        assert_eq!(swr.fetch_errors, 1);
    }

    #[test]
    fn test_reset_clears_tier_and_swr_counters() {
        let collector = MetricsCollector::new();
        collector.record_hit(TierId::FastKv, Duration::from_millis(3));
        collector.record_freshness(Freshness::Stale);
        collector.record_forced_refresh();
        collector.record_refresh();
        collector.record_fetch_error();

        collector.reset();
        assert_eq!(collector.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_data_point_orders_tiers_by_id() {
        let collector = MetricsCollector::new();
        collector.record_hit(TierId::Queryable, Duration::ZERO);
        collector.record_hit(TierId::FastKv, Duration::ZERO);

        let point = DataPoint::from_snapshot(&collector.snapshot());
        assert_eq!(point.blobs, vec!["fast_kv", "queryable"]);
    }

    #[test]
    fn test_prometheus_sink_sets_gauges() {
        let registry = Registry::new();
        let sink = PrometheusTelemetrySink::new(&registry).expect("register gauges");
        let collector = MetricsCollector::with_sink(Arc::new(sink.clone()));
        collector.record_hit(TierId::FastKv, Duration::from_millis(1));
        collector.record_metrics();

        assert_eq!(sink.tier_hits.with_label_values(&["fast_kv"]).get(), 1.0);
        assert_eq!(
            sink.hit_rate.with_label_values(&[DATA_POINT_INDEX]).get(),
            1.0
        );

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&sink.registry().gather(), &mut buffer)
            .expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("blaze_cache_tier_hits"));
    }

    #[test]
    fn test_prometheus_sink_rejects_double_registration() {
        let registry = Registry::new();
        assert!(PrometheusTelemetrySink::new(&registry).is_ok());
        assert!(PrometheusTelemetrySink::new(&registry).is_err());
    }

    proptest! {
        #[test]
        fn prop_online_average_equals_mean(
            samples in prop::collection::vec((any::<bool>(), 0u64..10_000), 1..200)
        ) {
            let mut metrics = TierMetrics::default();
            for (hit, micros) in &samples {
                metrics.record(*hit, *micros as f64 / 1000.0);
            }
            let mean = samples.iter().map(|(_, m)| *m as f64 / 1000.0).sum::<f64>()
                / samples.len() as f64;
            prop_assert!((metrics.avg_latency_ms - mean).abs() < 1e-6);
            prop_assert_eq!(metrics.total(), samples.len() as u64);
        }
    }
}
