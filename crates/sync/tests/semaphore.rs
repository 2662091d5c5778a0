//! Counting semaphore scenarios across several handles sharing one store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream;

use fleetlock_store::CoordinationStore;
use fleetlock_store_memory::{FaultMode, MemoryCoordinationStore};
use fleetlock_sync::{
    CoordinationError, DistributedSemaphore, GuardError, KeySpace, SemaphoreState,
};
use tokio::time::Instant;

const KEY: &str = "t:semaphore:pool";

fn handle(store: &Arc<MemoryCoordinationStore>, capacity: u32) -> DistributedSemaphore {
    DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(capacity)
        .ttl(Duration::from_secs(10))
        .blocking(false)
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap()
}

async fn members(store: &MemoryCoordinationStore) -> Vec<String> {
    let mut members = store
        .sorted_range_by_score(KEY, f64::NEG_INFINITY, f64::INFINITY)
        .await
        .unwrap();
    members.sort();
    members
}

#[tokio::test(start_paused = true)]
async fn one_past_capacity_is_refused_without_side_effects() {
    for capacity in 1..=5 {
        let store = Arc::new(MemoryCoordinationStore::new());
        let holders: Vec<_> = (0..capacity).map(|_| handle(&store, capacity)).collect();
        for holder in &holders {
            assert!(holder.acquire().await.unwrap());
        }
        let before = members(&store).await;
        assert_eq!(before.len(), capacity as usize);

        let extra = handle(&store, capacity);
        assert!(!extra.acquire().await.unwrap(), "capacity {capacity}");
        assert_eq!(extra.state(), SemaphoreState::NotAcquired);
        assert_eq!(members(&store).await, before);
        assert_eq!(extra.available_count().await.unwrap(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn reentrant_acquire_does_not_consume_a_slot() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = handle(&store, 3);

    assert!(sem.acquire().await.unwrap());
    assert!(sem.acquire().await.unwrap());
    assert_eq!(sem.current_count().await.unwrap(), 1);
    assert_eq!(sem.available_count().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn release_requires_a_held_slot() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = handle(&store, 1);

    let err = sem.release().await.unwrap_err();
    assert!(matches!(err, CoordinationError::SemaphoreNotAcquired { .. }));

    assert!(sem.acquire().await.unwrap());
    sem.release().await.unwrap();
    let err = sem.release().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::SemaphoreNotAcquired { ref key, .. } if key == "pool"
    ));
}

#[tokio::test(start_paused = true)]
async fn stale_members_are_ignored_and_pruned() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let now = store.now().await.unwrap();
    store.sorted_add(KEY, "crashed", now - 5.0).await.unwrap();
    assert_eq!(store.sorted_len(KEY).await.unwrap(), 1);

    let sem = handle(&store, 1);
    assert_eq!(sem.current_count().await.unwrap(), 0);
    assert_eq!(store.sorted_score(KEY, "crashed").await.unwrap(), None);

    store.sorted_add(KEY, "crashed", now - 5.0).await.unwrap();
    assert!(sem.acquire().await.unwrap(), "a stale holder never blocks");
    assert_eq!(store.sorted_score(KEY, "crashed").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_frees_its_slot_after_ttl() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let crashed = handle(&store, 1);
    assert!(crashed.acquire().await.unwrap());
    drop(crashed);

    let next = handle(&store, 1);
    assert!(!next.acquire().await.unwrap());
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(next.acquire().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn blocked_acquirer_gets_the_released_slot() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let a = handle(&store, 1);
    assert!(a.acquire().await.unwrap());

    let b = DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(1)
        .blocking(true)
        .blocking_timeout(Some(Duration::from_secs(5)))
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap();

    let started = Instant::now();
    let (acquired, ()) = tokio::join!(b.acquire(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        a.release().await.unwrap();
    });
    assert!(acquired.unwrap());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(b.holders().await.unwrap(), vec![b.instance_id().unwrap()]);
}

#[tokio::test(start_paused = true)]
async fn blocked_acquirer_times_out() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let a = handle(&store, 1);
    assert!(a.acquire().await.unwrap());

    let b = DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(1)
        .blocking_timeout(Some(Duration::from_secs(2)))
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = b.acquire().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::SemaphoreAcquisitionTimeout { ref key, capacity: 1, .. } if key == "pool"
    ));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(b.state(), SemaphoreState::NotAcquired);
}

#[tokio::test(start_paused = true)]
async fn keys_are_independent() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let pool = handle(&store, 1);
    let other = DistributedSemaphore::builder()
        .store(store.clone())
        .key("other")
        .capacity(1)
        .blocking(false)
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap();

    assert!(pool.acquire().await.unwrap());
    assert!(other.acquire().await.unwrap());
    assert_eq!(pool.current_count().await.unwrap(), 1);
    assert_eq!(other.current_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn slots_stay_exclusive_under_contention() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
    let counter = Arc::new(AtomicU64::new(0));

    let results: Vec<Result<(), GuardError<std::io::Error>>> = stream::iter(0..250)
        .map(|_| {
            let store = store.clone();
            let counter = counter.clone();
            async move {
                let sem = DistributedSemaphore::builder()
                    .store(store)
                    .key("stress")
                    .capacity(1)
                    .blocking_timeout(None)
                    .build()?;
                sem.scoped(|| async {
                    let seen = counter.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.store(seen + 10, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(())
                })
                .await
            }
        })
        .buffer_unordered(15)
        .collect()
        .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(counter.load(Ordering::SeqCst), 2500);
}

#[tokio::test(start_paused = true)]
async fn fallback_admission_still_honours_capacity() {
    let store = Arc::new(MemoryCoordinationStore::new());
    store.set_fault_mode(FaultMode::ScriptsFail);

    let a = handle(&store, 2);
    let b = handle(&store, 2);
    let c = handle(&store, 2);
    assert!(a.acquire().await.unwrap());
    assert!(a.acquire().await.unwrap(), "reentrant through the fallback");
    assert!(b.acquire().await.unwrap());
    assert!(!c.acquire().await.unwrap());
    assert_eq!(a.current_count().await.unwrap(), 2);

    b.release().await.unwrap();
    assert!(c.acquire().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn outage_during_blocking_acquire_times_out() {
    let store = Arc::new(MemoryCoordinationStore::new());
    store.set_fault_mode(FaultMode::Unavailable);
    let sem = DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(1)
        .blocking_timeout(Some(Duration::from_secs(1)))
        .build()
        .unwrap();

    let err = sem.acquire().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::SemaphoreAcquisitionTimeout { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn scoped_refuses_to_run_unacquired() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let holder = handle(&store, 1);
    assert!(holder.acquire().await.unwrap());

    let sem = handle(&store, 1);
    let ran = AtomicBool::new(false);
    let err = sem
        .scoped(|| async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.coordination(),
        Some(CoordinationError::SemaphoreUnavailable { capacity: 1, .. })
    ));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn scoped_renews_long_work_and_releases_on_error() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(1)
        .ttl(Duration::from_secs(3))
        .blocking(false)
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap();
    let held_late = AtomicBool::new(false);

    let err = sem
        .scoped(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            held_late.store(sem.is_acquired().await.unwrap(), Ordering::SeqCst);
            Err::<(), _>("worker crashed")
        })
        .await
        .unwrap_err();
    assert_eq!(err.into_operation(), Some("worker crashed"));
    assert!(held_late.load(Ordering::SeqCst), "slot outlived its ttl");
    assert_eq!(sem.state(), SemaphoreState::NotAcquired);
    assert_eq!(sem.current_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn scoped_work_is_cancelled_when_the_slot_is_lost() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = DistributedSemaphore::builder()
        .store(store.clone())
        .key("pool")
        .capacity(1)
        .ttl(Duration::from_secs(3))
        .blocking(false)
        .key_space(KeySpace::new("t"))
        .build()
        .unwrap();
    let finished = AtomicBool::new(false);

    let started = Instant::now();
    let (result, ()) = tokio::join!(
        sem.scoped(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            finished.store(true, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        }),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let id = sem.instance_id().unwrap();
            assert!(store.sorted_remove(KEY, &id).await.unwrap());
        }
    );

    let err = result.unwrap_err();
    assert!(matches!(
        err.coordination(),
        Some(CoordinationError::SemaphoreLost { key, .. }) if key == "pool"
    ));
    assert!(started.elapsed() <= Duration::from_secs(1));
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(sem.state(), SemaphoreState::NotAcquired);
}

#[tokio::test(start_paused = true)]
async fn dropped_scope_gives_the_slot_back() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = handle(&store, 1);

    let scope = sem.scoped(|| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, std::io::Error>(())
    });
    assert!(
        tokio::time::timeout(Duration::from_secs(1), scope)
            .await
            .is_err()
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.sorted_len(KEY).await.unwrap(), 0);
    assert_eq!(sem.state(), SemaphoreState::NotAcquired);
    let id = sem.instance_id().unwrap();
    assert!(sem.holder_metadata(&id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_never_takes_a_second_slot() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let sem = handle(&store, 2);
    let other = handle(&store, 2);
    assert!(sem.acquire().await.unwrap());

    store.set_fault_mode(FaultMode::Unavailable);
    assert!(!sem.acquire().await.unwrap());
    assert!(sem.release().await.is_err());
    store.set_fault_mode(FaultMode::None);

    assert!(sem.acquire().await.unwrap());
    assert_eq!(members(&store).await.len(), 1);
    assert!(other.acquire().await.unwrap(), "the second slot is still free");

    sem.release().await.unwrap();
    assert_eq!(members(&store).await, vec![other.instance_id().unwrap()]);
}
