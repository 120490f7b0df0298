//! Bulk cache warming.
//!
//! Keys are processed in sequential batches of `concurrency`. Within a
//! batch every key is checked, fetched and written concurrently, and the
//! whole batch settles before the next starts, so at most `concurrency`
//! origin calls are ever in flight. A failing key is counted and never
//! aborts the run.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use blaze_core::{FetchError, SwrPolicy, TtlPreset};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::coordinator::{PutOptions, TierCoordinator};

/// Options for a warm run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmOptions {
    pub policy: Option<SwrPolicy>,
    pub tags: Vec<String>,
    /// Fetch and write even when a live entry exists.
    pub force: bool,
}

impl WarmOptions {
    pub fn new() -> Self {
        Self::default()
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

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Outcome of one warm run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    pub total: usize,
    pub warmed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Warmed,
    Skipped,
    Failed,
}

/// Cumulative warmer statistics.
#[derive(Debug, Default)]
pub struct WarmerStats {
    pub runs: AtomicU64,
    pub warmed: AtomicU64,
    pub skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl WarmerStats {
    pub fn snapshot(&self) -> WarmerStatsSnapshot {
        WarmerStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            warmed: self.warmed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of warmer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmerStatsSnapshot {
    pub runs: u64,
    pub warmed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Populates keys ahead of demand through a [`TierCoordinator`].
#[derive(Debug)]
pub struct CacheWarmer {
    coordinator: Arc<TierCoordinator>,
    stats: Arc<WarmerStats>,
}

impl CacheWarmer {
    pub fn new(coordinator: Arc<TierCoordinator>) -> Self {
        Self {
            coordinator,
            stats: Arc::new(WarmerStats::default()),
        }
    }

    pub fn coordinator(&self) -> &Arc<TierCoordinator> {
        &self.coordinator
    }

    pub fn stats(&self) -> &Arc<WarmerStats> {
        &self.stats
    }

    /// Warm `keys` at the configured `warm_concurrency`.
    pub async fn warm<I, S, T, F, Fut>(&self, keys: I, fetcher: F, options: WarmOptions) -> WarmReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: Serialize,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let concurrency = self.coordinator.config().warm_concurrency;
        self.warm_keys(keys, concurrency, fetcher, options).await
    }

    /// Warm `keys` with at most `concurrency` fetches in flight.
    pub async fn warm_keys<I, S, T, F, Fut>(
        &self,
        keys: I,
        concurrency: usize,
        fetcher: F,
        options: WarmOptions,
    ) -> WarmReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: Serialize,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let started = Instant::now();
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let policy = options
            .policy
            .unwrap_or_else(|| self.coordinator.default_policy());

        let mut report = WarmReport {
            total: keys.len(),
            ..WarmReport::default()
        };

        for batch in keys.chunks(concurrency.max(1)) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|key| self.warm_one(key, &fetcher, policy, &options)),
            )
            .await;

            for outcome in outcomes {
                match outcome {
                    KeyOutcome::Warmed => report.warmed += 1,
                    KeyOutcome::Skipped => report.skipped += 1,
                    KeyOutcome::Failed => report.errors += 1,
                }
            }
        }

        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        self.stats.warmed.fetch_add(report.warmed as u64, Ordering::Relaxed);
        self.stats.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.stats.errors.fetch_add(report.errors as u64, Ordering::Relaxed);

        tracing::info!(
            total = report.total,
            warmed = report.warmed,
            skipped = report.skipped,
            errors = report.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cache warm completed"
        );
        report
    }

    async fn warm_one<T, F, Fut>(
        &self,
        key: &str,
        fetcher: &F,
        policy: SwrPolicy,
        options: &WarmOptions,
    ) -> KeyOutcome
    where
        T: Serialize,
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if !options.force && self.coordinator.contains(key).await {
            return KeyOutcome::Skipped;
        }

        let value = match fetcher(key.to_string()).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "Warm fetch failed");
                return KeyOutcome::Failed;
            }
        };

        let put = PutOptions::new()
            .with_policy(policy)
            .with_tags(options.tags.iter().cloned());
        match self.coordinator.put(key, &value, put).await {
            Ok(outcome) if outcome.all_failed() => {
                tracing::warn!(key, "Warm write rejected by every tier");
                KeyOutcome::Failed
            }
            Ok(_) => KeyOutcome::Warmed,
            Err(e) => {
                tracing::warn!(key, error = %e, "Warm write failed");
                KeyOutcome::Failed
            }
        }
    }
}
