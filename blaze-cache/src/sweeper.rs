//! Expiry sweeper background task.
//!
//! Tiers without native TTL keep expired entries until something deletes
//! them. This task periodically asks every tier to purge entries whose
//! envelope has expired, and emits a metrics data point on its own
//! interval, until the shutdown signal is received.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blaze_core::CacheConfig;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::coordinator::TierCoordinator;

/// Default interval between metrics data points.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the sweeper task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    pub sweep_interval: Duration,
    pub metrics_interval: Duration,
}

impl SweepConfig {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

/// Counters for the sweeper's lifetime.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    pub cycles: AtomicU64,
    pub entries_purged: AtomicU64,
    pub tier_errors: AtomicU64,
    pub data_points: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            entries_purged: self.entries_purged.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
            data_points: self.data_points.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub cycles: u64,
    pub entries_purged: u64,
    pub tier_errors: u64,
    pub data_points: u64,
}

/// Run one purge cycle across every tier. Returns the entries removed.
pub async fn sweep_once(coordinator: &TierCoordinator, metrics: &SweepMetrics) -> u64 {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let report = coordinator.purge_expired(coordinator.now()).await;
    metrics
        .entries_purged
        .fetch_add(report.purged, Ordering::Relaxed);
    metrics
        .tier_errors
        .fetch_add(report.failed.len() as u64, Ordering::Relaxed);

    if report.purged > 0 || !report.failed.is_empty() {
        tracing::info!(
            purged = report.purged,
            failed_tiers = report.failed.len(),
            "Expiry sweep completed"
        );
    } else {
        tracing::trace!("Expiry sweep completed with nothing to purge");
    }
    report.purged
}

/// Background task that purges expired entries until shutdown.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let config = SweepConfig::new(coordinator.config());
/// let handle = tokio::spawn(expiry_sweep_task(coordinator, config, shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn expiry_sweep_task(
    coordinator: Arc<TierCoordinator>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics> {
    let metrics = Arc::new(SweepMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut metrics_interval = interval(config.metrics_interval);
    metrics_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        metrics_interval_secs = config.metrics_interval.as_secs(),
        "Expiry sweeper started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Expiry sweeper shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&coordinator, &metrics).await;
            }

            _ = metrics_interval.tick() => {
                if coordinator.metrics().record_metrics().is_some() {
                    metrics.data_points.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        entries_purged = snapshot.entries_purged,
        tier_errors = snapshot.tier_errors,
        "Expiry sweeper completed"
    );

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{ListPage, TierPutOptions, TierStore};
    use async_trait::async_trait;
    use blaze_core::{TierDescriptor, TierError, TierId, Timestamp};

    /// Durable tier stand-in that reports a fixed purge count.
    struct PurgingTier {
        purges: AtomicU64,
        per_call: u64,
        fail: bool,
    }

    #[async_trait]
    impl TierStore for PurgingTier {
        fn descriptor(&self) -> TierDescriptor {
            TierDescriptor::new(TierId::Queryable)
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, TierError> {
            Ok(None)
        }

        async fn put(&self, _: &str, _: &[u8], _: &TierPutOptions) -> Result<(), TierError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), TierError> {
            Ok(())
        }

        async fn list(&self, _: &str, _: Option<&str>, _: usize) -> Result<ListPage, TierError> {
            Ok(ListPage::default())
        }

        async fn purge_expired(&self, _now: Timestamp) -> Result<u64, TierError> {
            self.purges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TierError::backend(TierId::Queryable, "disk full"));
            }
            Ok(self.per_call)
        }
    }

    fn coordinator(per_call: u64, fail: bool) -> (Arc<TierCoordinator>, Arc<PurgingTier>) {
        let tier = Arc::new(PurgingTier {
            purges: AtomicU64::new(0),
            per_call,
            fail,
        });
        let store: Arc<dyn TierStore> = tier.clone();
        let coordinator =
            TierCoordinator::new(vec![store], CacheConfig::default()).expect("valid config");
        (Arc::new(coordinator), tier)
    }

    #[tokio::test]
    async fn test_sweep_once_counts_purged() {
        let (coordinator, _) = coordinator(3, false);
        let metrics = SweepMetrics::new();
        assert_eq!(sweep_once(&coordinator, &metrics).await, 3);
        assert_eq!(sweep_once(&coordinator, &metrics).await, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 2);
        assert_eq!(snapshot.entries_purged, 6);
        assert_eq!(snapshot.tier_errors, 0);
    }

    #[tokio::test]
    async fn test_sweep_once_records_tier_errors() {
        let (coordinator, _) = coordinator(0, true);
        let metrics = SweepMetrics::new();
        assert_eq!(sweep_once(&coordinator, &metrics).await, 0);
        assert_eq!(metrics.snapshot().tier_errors, 1);
    }

    #[tokio::test]
    async fn test_task_runs_until_shutdown() {
        let (coordinator, tier) = coordinator(1, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = SweepConfig {
            sweep_interval: Duration::from_millis(10),
            metrics_interval: Duration::from_millis(10),
        };

        let handle = tokio::spawn(expiry_sweep_task(coordinator, config, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("task alive");

        let metrics = handle.await.expect("task completes");
        let snapshot = metrics.snapshot();
        assert!(snapshot.cycles >= 1);
        assert_eq!(snapshot.entries_purged, snapshot.cycles);
        assert_eq!(tier.purges.load(Ordering::SeqCst), snapshot.cycles);
        // No sink configured.
        assert_eq!(snapshot.data_points, 0);
    }
}
