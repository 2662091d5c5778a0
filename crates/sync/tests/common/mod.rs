//! Shared fixtures for the fleet scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetlock_store::{CoordinationStore, StoreError};
use fleetlock_store_memory::MemoryCoordinationStore;

/// A memory store that counts the calls it receives.
#[derive(Debug, Default)]
pub struct CountingStore {
    pub inner: MemoryCoordinationStore,
    calls: AtomicUsize,
    extends: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call, of any kind.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Lock renewals.
    pub fn extends(&self) -> usize {
        self.extends.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn now(&self) -> Result<f64, StoreError> {
        self.hit();
        self.inner.now().await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.hit();
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.hit();
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.hit();
        self.inner.delete(key).await
    }

    async fn set_fenced_if_absent(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.inner
            .set_fenced_if_absent(key, value, fence_key, token, ttl)
            .await
    }

    async fn extend_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.extends.fetch_add(1, Ordering::SeqCst);
        self.inner
            .extend_fenced(key, value, fence_key, token, ttl)
            .await
    }

    async fn delete_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.inner.delete_fenced(key, value, fence_key, token).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.hit();
        self.inner.sorted_add(key, member, score).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.hit();
        self.inner.sorted_remove(key, member).await
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.hit();
        self.inner.sorted_score(key, member).await
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        self.hit();
        self.inner.sorted_len(key).await
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.hit();
        self.inner.sorted_range_by_score(key, min, max).await
    }

    async fn sorted_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.hit();
        self.inner.sorted_remove_by_score(key, min, max).await
    }

    async fn sorted_add_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
        capacity: u32,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.inner
            .sorted_add_bounded(key, member, score, now, capacity)
            .await
    }

    async fn sorted_renew(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
    ) -> Result<bool, StoreError> {
        self.hit();
        self.inner.sorted_renew(key, member, score, now).await
    }
}
