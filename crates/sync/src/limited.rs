//! Concurrency limiting over a family of semaphore keys.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleetlock_store::CoordinationStore;

use crate::config::SemaphoreConfig;
use crate::error::{CoordinationError, GuardError};
use crate::keys::KeySpace;
use crate::resolve::{KeySource, StoreSource};
use crate::semaphore::{DistributedSemaphore, SemaphoreParams};

/// Limits how many calls sharing a semaphore key run at once, fleet-wide.
///
/// The key (and optionally the store) is derived from each call's
/// arguments, so one limiter can cap, say, concurrent jobs per node. Each
/// call runs under its own slot via [`DistributedSemaphore::scoped`].
#[derive(Debug, Clone)]
pub struct SemaphoreLimited<A> {
    store: StoreSource<A>,
    key: KeySource<A>,
    params: SemaphoreParams,
}

/// Fluent builder for [`SemaphoreLimited`].
pub struct SemaphoreLimitedBuilder<A> {
    store: Option<StoreSource<A>>,
    key: Option<KeySource<A>>,
    capacity: Option<u32>,
    params: SemaphoreParams,
}

impl<A> Default for SemaphoreLimitedBuilder<A> {
    fn default() -> Self {
        Self {
            store: None,
            key: None,
            capacity: None,
            params: SemaphoreParams::from_config(0, &SemaphoreConfig::default()),
        }
    }
}

impl<A> SemaphoreLimitedBuilder<A> {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(StoreSource::shared(store));
        self
    }

    #[must_use]
    pub fn store_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> Arc<dyn CoordinationStore> + Send + Sync + 'static,
    {
        self.store = Some(StoreSource::resolver(f));
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<KeySource<A>>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key = Some(KeySource::derived(f));
        self
    }

    #[must_use]
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.params.ttl = ttl;
        self
    }

    #[must_use]
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.params.blocking = blocking;
        self
    }

    #[must_use]
    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.params.blocking_timeout = timeout;
        self
    }

    #[must_use]
    pub fn expected_hold(mut self, expected: Duration) -> Self {
        self.params.expected_hold = expected;
        self
    }

    #[must_use]
    pub fn key_space(mut self, keys: KeySpace) -> Self {
        self.params.keys = keys;
        self
    }

    #[must_use]
    pub fn config(mut self, config: &SemaphoreConfig) -> Self {
        let keys = std::mem::take(&mut self.params.keys);
        self.params = SemaphoreParams::from_config(0, config);
        self.params.keys = keys;
        self
    }

    pub fn build(mut self) -> Result<SemaphoreLimited<A>, CoordinationError> {
        let store = self
            .store
            .ok_or_else(|| CoordinationError::Config("a store is required".into()))?;
        let key = self
            .key
            .ok_or_else(|| CoordinationError::Config("a semaphore key is required".into()))?;
        key.validate()?;
        self.params.capacity = self
            .capacity
            .ok_or_else(|| CoordinationError::Config("a semaphore capacity is required".into()))?;
        self.params.validate()?;
        Ok(SemaphoreLimited {
            store,
            key,
            params: self.params,
        })
    }
}

impl<A> SemaphoreLimited<A> {
    pub fn builder() -> SemaphoreLimitedBuilder<A> {
        SemaphoreLimitedBuilder::default()
    }

    /// The semaphore a call with these arguments would run under.
    pub fn semaphore_for(&self, args: &A) -> Result<DistributedSemaphore, CoordinationError> {
        let name = self.key.resolve(args)?;
        let store = self.store.resolve(args);
        DistributedSemaphore::with_params(store, name, self.params.clone())
    }

    /// Run `op` under a slot of the semaphore resolved from `args`.
    pub async fn run<F, Fut, T, E>(&self, args: A, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let semaphore = self.semaphore_for(&args)?;
        semaphore.scoped(move || op(args)).await
    }
}
