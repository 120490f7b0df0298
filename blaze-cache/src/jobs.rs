//! Bounded pool of detached background jobs.
//!
//! Promotion, stale revalidation and corrupt-entry purges never block the
//! request that triggered them. They run as detached tokio tasks, bounded
//! by a semaphore so the number in flight cannot grow without limit. When
//! the pool is full a new job is dropped and counted rather than queued:
//! every job here is best-effort and will be retried naturally by a later
//! read.
//!
//! Job failures go to the `tracing` error sink and the per-kind counters;
//! they never reach the caller.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use blaze_core::BlazeError;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Copy an entry found in a slower tier into a faster one.
    Promotion,
    /// Refresh a stale entry from its origin.
    Revalidation,
    /// Delete an unreadable entry from the tier it was found in.
    CorruptPurge,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Promotion, JobKind::Revalidation, JobKind::CorruptPurge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promotion => "promotion",
            Self::Revalidation => "revalidation",
            Self::CorruptPurge => "corrupt_purge",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Promotion => 0,
            Self::Revalidation => 1,
            Self::CorruptPurge => 2,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Counters for one job kind at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Snapshot of all job counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobsSnapshot {
    pub promotion: JobCounts,
    pub revalidation: JobCounts,
    pub corrupt_purge: JobCounts,
    pub in_flight: usize,
}

impl JobsSnapshot {
    pub fn get(&self, kind: JobKind) -> JobCounts {
        match kind {
            JobKind::Promotion => self.promotion,
            JobKind::Revalidation => self.revalidation,
            JobKind::CorruptPurge => self.corrupt_purge,
        }
    }
}

struct JobsInner {
    permits: Arc<Semaphore>,
    capacity: usize,
    pending: AtomicUsize,
    idle: Notify,
    counters: [KindCounters; 3],
}

/// Decrements the pending count when a job finishes, even by panic.
struct PendingGuard(Arc<JobsInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Handle to the background job pool. Clones share the same pool.
#[derive(Clone)]
pub struct BackgroundJobs {
    inner: Arc<JobsInner>,
}

impl BackgroundJobs {
    /// Create a pool running at most `capacity` jobs at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(JobsInner {
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                counters: Default::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Dispatch `job` as a detached task.
    ///
    /// Returns `false` when the pool is saturated and the job was dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, kind: JobKind, key: &str, job: F) -> bool
    where
        F: Future<Output = Result<(), BlazeError>> + Send + 'static,
    {
        let counters = &self.inner.counters[kind.index()];

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = %kind,
                    key,
                    capacity = self.inner.capacity,
                    "Background job pool saturated, job dropped"
                );
                return false;
            }
        };

        counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.fetch_add(1, Ordering::AcqRel);

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            // Declared before the permit so the permit is released first.
            let _guard = PendingGuard(Arc::clone(&inner));
            let _permit = permit;
            let counters = &inner.counters[kind.index()];

            match job.await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(kind = %kind, key = %key, error = %e, "Background job failed");
                }
            }
        });
        true
    }

    /// Wait until no jobs are in flight, including jobs spawned while
    /// waiting.
    pub async fn flush(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> JobsSnapshot {
        let counts = |kind: JobKind| {
            let c = &self.inner.counters[kind.index()];
            JobCounts {
                spawned: c.spawned.load(Ordering::Relaxed),
                completed: c.completed.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
            }
        };
        JobsSnapshot {
            promotion: counts(JobKind::Promotion),
            revalidation: counts(JobKind::Revalidation),
            corrupt_purge: counts(JobKind::CorruptPurge),
            in_flight: self.in_flight(),
        }
    }
}

impl fmt::Debug for BackgroundJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundJobs")
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
