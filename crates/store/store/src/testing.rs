use std::time::Duration;

use crate::error::StoreError;
use crate::store::CoordinationStore;

/// Run the full coordination store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
/// Every key used by the suite starts with `namespace`, so a shared backend
/// can be exercised without clashing with other data.
///
/// # Errors
///
/// Returns an error if the store fails an operation outright. Behavioural
/// mismatches panic through `assert!`.
pub async fn run_store_conformance_tests(
    store: &dyn CoordinationStore,
    namespace: &str,
) -> Result<(), StoreError> {
    test_now_is_epoch(store).await?;
    test_set_if_absent(store, namespace).await?;
    test_set_get_delete(store, namespace).await?;
    test_set_fenced_if_absent(store, namespace).await?;
    test_extend_fenced(store, namespace).await?;
    test_delete_fenced(store, namespace).await?;
    test_sorted_basics(store, namespace).await?;
    test_sorted_range_and_prune(store, namespace).await?;
    test_sorted_add_bounded(store, namespace).await?;
    test_sorted_add_bounded_prunes(store, namespace).await?;
    test_sorted_renew(store, namespace).await?;
    Ok(())
}

async fn test_now_is_epoch(store: &dyn CoordinationStore) -> Result<(), StoreError> {
    let now = store.now().await?;
    // 2020-01-01T00:00:00Z
    assert!(now > 1_577_836_800.0, "now() should be seconds since the epoch");
    Ok(())
}

async fn test_set_if_absent(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:nx");
    let ttl = Duration::from_secs(10);
    assert!(store.set_if_absent(&key, "a", ttl).await?, "first set should win");
    assert!(
        !store.set_if_absent(&key, "b", ttl).await?,
        "second set should lose while the key exists"
    );
    assert_eq!(store.get(&key).await?.as_deref(), Some("a"));
    store.delete(&key).await?;
    Ok(())
}

async fn test_set_get_delete(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:plain");
    assert!(store.get(&key).await?.is_none(), "missing key reads as None");
    store.set(&key, "v1", Duration::from_secs(10)).await?;
    store.set(&key, "v2", Duration::from_secs(10)).await?;
    assert_eq!(store.get(&key).await?.as_deref(), Some("v2"));
    assert!(store.delete(&key).await?, "delete should report an existing key");
    assert!(!store.delete(&key).await?, "delete on a missing key reports false");
    Ok(())
}

async fn test_set_fenced_if_absent(
    store: &dyn CoordinationStore,
    ns: &str,
) -> Result<(), StoreError> {
    let key = format!("{ns}:fenced-nx");
    let fence = format!("{key}:owner");
    let ttl = Duration::from_secs(10);
    assert!(store.set_fenced_if_absent(&key, "replica", &fence, "t1", ttl).await?);
    assert!(
        !store.set_fenced_if_absent(&key, "replica", &fence, "t2", ttl).await?,
        "the same value must not take a held lease"
    );
    assert_eq!(store.get(&key).await?.as_deref(), Some("replica"));
    assert_eq!(store.get(&fence).await?.as_deref(), Some("t1"));
    store.delete(&key).await?;
    store.delete(&fence).await?;
    Ok(())
}

async fn test_extend_fenced(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:fenced-extend");
    let fence = format!("{key}:owner");
    let ttl = Duration::from_secs(20);
    assert!(
        store
            .set_fenced_if_absent(&key, "replica", &fence, "t1", Duration::from_secs(5))
            .await?
    );
    assert!(store.extend_fenced(&key, "replica", &fence, "t1", ttl).await?);
    assert!(
        !store.extend_fenced(&key, "replica", &fence, "t2", ttl).await?,
        "another token must not extend the lease"
    );
    assert!(
        !store.extend_fenced(&key, "intruder", &fence, "t1", ttl).await?,
        "another value must not extend the lease"
    );

    // Lease lapsed and was retaken by a holder using the same value.
    store.delete(&key).await?;
    assert!(!store.extend_fenced(&key, "replica", &fence, "t1", ttl).await?);
    assert!(store.set_fenced_if_absent(&key, "replica", &fence, "t2", ttl).await?);
    assert!(
        !store.extend_fenced(&key, "replica", &fence, "t1", ttl).await?,
        "a stale token must not extend the new holder's lease"
    );
    store.delete(&key).await?;
    store.delete(&fence).await?;
    Ok(())
}

async fn test_delete_fenced(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:fenced-delete");
    let fence = format!("{key}:owner");
    let ttl = Duration::from_secs(10);
    assert!(store.set_fenced_if_absent(&key, "replica", &fence, "t2", ttl).await?);
    assert!(!store.delete_fenced(&key, "replica", &fence, "t1").await?);
    assert_eq!(
        store.get(&key).await?.as_deref(),
        Some("replica"),
        "a stale token must not delete the new holder's lease"
    );
    assert!(store.delete_fenced(&key, "replica", &fence, "t2").await?);
    assert!(store.get(&key).await?.is_none());
    assert!(store.get(&fence).await?.is_none());
    assert!(
        !store.delete_fenced(&key, "replica", &fence, "t2").await?,
        "second delete is a no-op"
    );

    // An overwritten key is left to its new owner; the fence still goes.
    assert!(store.set_fenced_if_absent(&key, "replica", &fence, "t3", ttl).await?);
    store.set(&key, "intruder", ttl).await?;
    assert!(!store.delete_fenced(&key, "replica", &fence, "t3").await?);
    assert_eq!(store.get(&key).await?.as_deref(), Some("intruder"));
    assert!(store.get(&fence).await?.is_none());
    store.delete(&key).await?;
    Ok(())
}

async fn test_sorted_basics(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:zset-basics");
    store.sorted_add(&key, "a", 10.0).await?;
    store.sorted_add(&key, "b", 20.0).await?;
    store.sorted_add(&key, "a", 15.0).await?;
    assert_eq!(store.sorted_len(&key).await?, 2, "re-adding updates the score");
    assert_eq!(store.sorted_score(&key, "a").await?, Some(15.0));
    assert_eq!(store.sorted_score(&key, "zz").await?, None);
    assert!(store.sorted_remove(&key, "a").await?);
    assert!(!store.sorted_remove(&key, "a").await?);
    assert!(store.sorted_remove(&key, "b").await?);
    assert_eq!(store.sorted_len(&key).await?, 0);
    Ok(())
}

async fn test_sorted_range_and_prune(
    store: &dyn CoordinationStore,
    ns: &str,
) -> Result<(), StoreError> {
    let key = format!("{ns}:zset-range");
    store.sorted_add(&key, "old", 100.0).await?;
    store.sorted_add(&key, "mid", 200.0).await?;
    store.sorted_add(&key, "new", 300.0).await?;

    let live = store.sorted_range_by_score(&key, 150.0, f64::INFINITY).await?;
    assert_eq!(live, vec!["mid".to_owned(), "new".to_owned()]);

    let removed = store
        .sorted_remove_by_score(&key, f64::NEG_INFINITY, 200.0)
        .await?;
    assert_eq!(removed, 2, "bounds are inclusive");
    assert_eq!(store.sorted_len(&key).await?, 1);
    store.sorted_remove(&key, "new").await?;
    Ok(())
}

async fn test_sorted_add_bounded(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:zset-bounded");
    let now = store.now().await?;
    let score = now + 60.0;

    assert!(store.sorted_add_bounded(&key, "h1", score, now, 2).await?);
    assert!(store.sorted_add_bounded(&key, "h2", score, now, 2).await?);
    assert!(
        !store.sorted_add_bounded(&key, "h3", score, now, 2).await?,
        "a full set must reject new members"
    );
    assert_eq!(store.sorted_len(&key).await?, 2, "rejected member is not added");
    assert_eq!(store.sorted_score(&key, "h3").await?, None);

    store.sorted_remove(&key, "h1").await?;
    store.sorted_remove(&key, "h2").await?;
    Ok(())
}

async fn test_sorted_add_bounded_prunes(
    store: &dyn CoordinationStore,
    ns: &str,
) -> Result<(), StoreError> {
    let key = format!("{ns}:zset-bounded-prune");
    let now = store.now().await?;

    store.sorted_add(&key, "stale", now - 30.0).await?;
    assert!(
        store
            .sorted_add_bounded(&key, "fresh", now + 60.0, now, 1)
            .await?,
        "an expired member must not consume capacity"
    );
    assert_eq!(store.sorted_score(&key, "stale").await?, None, "stale member pruned");
    store.sorted_remove(&key, "fresh").await?;
    Ok(())
}

async fn test_sorted_renew(store: &dyn CoordinationStore, ns: &str) -> Result<(), StoreError> {
    let key = format!("{ns}:zset-renew");
    let now = store.now().await?;

    store.sorted_add(&key, "live", now + 5.0).await?;
    assert!(store.sorted_renew(&key, "live", now + 60.0, now).await?);
    assert_eq!(store.sorted_score(&key, "live").await?, Some(now + 60.0));

    assert!(
        !store.sorted_renew(&key, "absent", now + 60.0, now).await?,
        "renew must not add a missing member"
    );
    assert_eq!(store.sorted_score(&key, "absent").await?, None);

    store.sorted_add(&key, "expired", now - 1.0).await?;
    assert!(!store.sorted_renew(&key, "expired", now + 60.0, now).await?);
    assert_eq!(
        store.sorted_score(&key, "expired").await?,
        None,
        "an expired member is removed rather than revived"
    );

    store.sorted_remove(&key, "live").await?;
    Ok(())
}
