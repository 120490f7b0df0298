//! Integration tests for stale-while-revalidate reads.
//!
//! Time is driven by a shared `ManualClock`; background revalidations are
//! awaited through `TierCoordinator::flush`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blaze_cache::{SwrEngine, SwrOptions, TierCoordinator};
use blaze_test_utils::assertions::assert_fetch_error;
use blaze_test_utils::fixtures::{as_stores, coordinator, manual_clock, memory_tiers, policy};
use blaze_test_utils::{
    Clock, CountingFetcher, FetchError, Freshness, ManualClock, MemoryTier, TierId,
};
use futures_util::future::join_all;

const KEY: &str = "bsi:mlb:standings:al-west";

fn engine() -> (SwrEngine, ManualClock, [Arc<MemoryTier>; 3]) {
    let clock = manual_clock();
    let tiers = memory_tiers();
    let coordinator: Arc<TierCoordinator> = Arc::new(coordinator(as_stores(&tiers), &clock));
    (SwrEngine::new(coordinator), clock, tiers)
}

fn options() -> SwrOptions {
    SwrOptions::new().with_policy(policy(60, 30))
}

type BoxedFetch = Pin<Box<dyn Future<Output = Result<u32, FetchError>> + Send>>;

/// Origin call that takes `delay` to answer.
fn slow_fetcher(
    calls: &Arc<AtomicUsize>,
    value: u32,
    delay: Duration,
) -> impl FnOnce() -> BoxedFetch + Send + 'static {
    let calls = Arc::clone(calls);
    move || -> BoxedFetch {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }
}

#[tokio::test]
async fn test_fresh_stale_miss_timeline() {
    let (engine, clock, _tiers) = engine();
    let origin = CountingFetcher::new();

    // t=0: miss, synchronous fetch.
    let read = engine.get(KEY, origin.returning(1u32), options()).await.unwrap();
    assert_eq!(*read.value(), 1);
    assert_eq!(read.freshness(), Freshness::Miss);
    assert!(!read.was_cache_hit());
    assert_eq!(origin.calls(), 1);

    // t=10: fresh, origin untouched.
    clock.advance(Duration::from_secs(10));
    let read = engine.get(KEY, origin.returning(2u32), options()).await.unwrap();
    assert_eq!(*read.value(), 1);
    assert_eq!(read.freshness(), Freshness::Fresh);
    assert_eq!(read.source_tier(), Some(TierId::FastKv));
    assert_eq!(origin.calls(), 1);

    // t=45: stale, old value served while one background fetch runs.
    clock.advance(Duration::from_secs(35));
    let read = engine.get(KEY, origin.failing::<u32>(KEY), options()).await.unwrap();
    assert_eq!(*read.value(), 1);
    assert_eq!(read.freshness(), Freshness::Stale);
    assert!(read.was_cache_hit());
    engine.coordinator().flush().await;
    assert_eq!(origin.calls(), 2);
    assert_eq!(engine.in_flight_revalidations(), 0);

    // t=70: expired, synchronous fetch again.
    clock.advance(Duration::from_secs(25));
    let read = engine.get(KEY, origin.returning(3u32), options()).await.unwrap();
    assert_eq!(*read.value(), 3);
    assert_eq!(read.freshness(), Freshness::Miss);
    assert_eq!(origin.calls(), 3);

    let swr = engine.coordinator().metrics().snapshot().swr;
    assert_eq!(swr.miss, 2);
    assert_eq!(swr.fresh, 1);
    assert_eq!(swr.stale, 1);
    assert_eq!(swr.fetch_errors, 1);
    assert_eq!(swr.refreshed, 0);
}

#[tokio::test]
async fn test_stale_read_refreshes_in_background() {
    let (engine, clock, tiers) = engine();
    let origin = CountingFetcher::new();
    engine.get(KEY, origin.returning(1u32), options()).await.unwrap();

    clock.advance(Duration::from_secs(45));
    let read = engine.get(KEY, origin.returning(2u32), SwrOptions::new()).await.unwrap();
    assert_eq!(*read.value(), 1);
    engine.coordinator().flush().await;
    assert_eq!(origin.calls(), 2);

    // The refreshed entry keeps the original 60s/30s policy from now on.
    let read = engine.get(KEY, origin.returning(3u32), SwrOptions::new()).await.unwrap();
    assert_eq!(*read.value(), 2);
    assert_eq!(read.freshness(), Freshness::Fresh);
    assert_eq!(read.cached_at(), clock.now());
    assert_eq!(origin.calls(), 2);
    assert_eq!(
        tiers[0].last_options(KEY).and_then(|o| o.ttl),
        Some(Duration::from_secs(60))
    );
    assert_eq!(engine.coordinator().metrics().snapshot().swr.refreshed, 1);
}

#[tokio::test]
async fn test_concurrent_stale_reads_refresh_once() {
    let (engine, clock, _tiers) = engine();
    let origin = CountingFetcher::new();
    engine.get(KEY, origin.returning(1u32), options()).await.unwrap();

    clock.advance(Duration::from_secs(45));
    let reads = join_all(
        (0..5).map(|i| engine.get(KEY, origin.returning(10 + i as u32), SwrOptions::new())),
    )
    .await;
    for read in reads {
        let read = read.unwrap();
        assert_eq!(*read.value(), 1);
        assert_eq!(read.freshness(), Freshness::Stale);
    }

    engine.coordinator().flush().await;
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let (engine, _clock, _tiers) = engine();
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = join_all((0..8).map(|i| {
        engine.get(
            KEY,
            slow_fetcher(&calls, 100 + i, Duration::from_millis(20)),
            options(),
        )
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let reads: Vec<_> = reads.into_iter().map(Result::unwrap).collect();
    assert!(reads.iter().all(|r| *r.value() == 100));
    assert_eq!(reads.iter().filter(|r| r.was_cache_hit()).count(), 7);
    assert_eq!(engine.in_flight_fetches(), 0);
}

#[tokio::test]
async fn test_fresh_entry_never_calls_origin() {
    let (engine, clock, _tiers) = engine();
    let origin = CountingFetcher::new();
    engine.get(KEY, origin.returning(1u32), options()).await.unwrap();

    for _ in 0..5 {
        clock.advance(Duration::from_secs(5));
        let read = engine.get(KEY, origin.returning(2u32), options()).await.unwrap();
        assert_eq!(read.freshness(), Freshness::Fresh);
    }
    engine.coordinator().flush().await;
    assert_eq!(origin.calls(), 1);
}

#[tokio::test]
async fn test_force_refresh_bypasses_fresh_entry() {
    let (engine, _clock, _tiers) = engine();
    let origin = CountingFetcher::new();
    engine.get(KEY, origin.returning(1u32), options()).await.unwrap();

    let read = engine
        .get(KEY, origin.returning(2u32), options().force_refresh())
        .await
        .unwrap();
    assert_eq!(*read.value(), 2);
    assert!(!read.was_cache_hit());
    assert_eq!(origin.calls(), 2);

    let read = engine.get(KEY, origin.returning(3u32), options()).await.unwrap();
    assert_eq!(*read.value(), 2);
    assert_eq!(engine.coordinator().metrics().snapshot().swr.forced, 1);
}

#[tokio::test]
async fn test_miss_with_failing_origin_propagates_error() {
    let (engine, _clock, tiers) = engine();
    let origin = CountingFetcher::new();

    let result = engine.get(KEY, origin.failing::<u32>(KEY), options()).await;
    assert_fetch_error(&result);
    assert!(tiers.iter().all(|tier| tier.is_empty()));
}

#[tokio::test]
async fn test_tags_from_options_are_registered() {
    let (engine, _clock, _tiers) = engine();
    let origin = CountingFetcher::new();
    engine
        .get(KEY, origin.returning(1u32), options().with_tags(["mlb", "standings"]))
        .await
        .unwrap();

    assert_eq!(engine.coordinator().invalidate_by_tag("standings").await, 1);
    assert!(!engine.coordinator().contains(KEY).await);
}
