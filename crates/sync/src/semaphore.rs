//! Fleet-wide counting semaphore.
//!
//! Holders are members of one sorted set per semaphore key, scored by the
//! store-clock epoch at which their slot expires. Every count-affecting
//! call first prunes members scored at or below the store's `now`, so a
//! crashed holder stops counting once its TTL elapses.
//!
//! Admission is a single store-side check-and-add
//! ([`CoordinationStore::sorted_add_bounded`]). If the store cannot run it
//! the semaphore degrades to a client-side check-then-add, which may
//! briefly overshoot capacity under contention. If that fails too the
//! attempt counts as "not acquired": for this primitive a missing slot is
//! an ordinary outcome, unlike the exclusive guard which fails loud.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlock_store::{CoordinationStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SemaphoreConfig;
use crate::error::{CoordinationError, GuardError};
use crate::keys::KeySpace;
use crate::lease::{Backoff, Lease, RenewalTask, renewal_interval, report_hold};

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_millis(500);

/// Lifecycle of a semaphore handle within one acquire/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreState {
    NotAcquired,
    Acquiring,
    Acquired,
}

/// Diagnostic record mirrored next to each holder.
///
/// Written after the slot is taken and deleted after it is released, so it
/// may briefly disagree with the sorted set. Never consulted for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderMetadata {
    pub key: String,
    pub instance_id: String,
    pub capacity: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Parameters shared by every semaphore built from one configuration.
#[derive(Debug, Clone)]
pub(crate) struct SemaphoreParams {
    pub(crate) capacity: u32,
    pub(crate) ttl: Duration,
    pub(crate) blocking: bool,
    pub(crate) blocking_timeout: Option<Duration>,
    pub(crate) expected_hold: Duration,
    pub(crate) keys: KeySpace,
}

impl SemaphoreParams {
    pub(crate) fn from_config(capacity: u32, config: &SemaphoreConfig) -> Self {
        Self {
            capacity,
            ttl: config.ttl(),
            blocking: config.blocking,
            blocking_timeout: config.blocking_timeout(),
            expected_hold: config.expected_hold(),
            keys: KeySpace::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), CoordinationError> {
        if self.capacity == 0 {
            return Err(CoordinationError::Config(
                "semaphore capacity must be positive".into(),
            ));
        }
        if self.ttl.is_zero() {
            return Err(CoordinationError::Config(
                "semaphore ttl must be positive".into(),
            ));
        }
        if self.blocking_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CoordinationError::Config(
                "semaphore blocking timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A handle on one fleet-wide bounded resource pool.
///
/// A handle holds at most one slot. Acquiring again while holding it
/// refreshes the slot instead of taking another one. After a release the
/// handle can be reused; the next cycle runs under a fresh instance id.
#[derive(Debug, Clone)]
pub struct DistributedSemaphore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Slot {
    state: SemaphoreState,
    instance_id: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    name: String,
    key: String,
    params: SemaphoreParams,
    slot: Mutex<Slot>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("key", &self.key)
            .field("params", &self.params)
            .field("slot", &*self.slot.lock())
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`DistributedSemaphore`].
pub struct DistributedSemaphoreBuilder {
    store: Option<Arc<dyn CoordinationStore>>,
    key: Option<String>,
    capacity: Option<u32>,
    params: SemaphoreParams,
}

impl Default for DistributedSemaphoreBuilder {
    fn default() -> Self {
        Self {
            store: None,
            key: None,
            capacity: None,
            params: SemaphoreParams::from_config(0, &SemaphoreConfig::default()),
        }
    }
}

impl DistributedSemaphoreBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Maximum number of concurrent holders fleet-wide. Required.
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

    /// Bound the wait of a blocking acquire. `None` waits forever.
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

    /// Take ttl, blocking mode, blocking timeout and expected hold from a
    /// config section.
    #[must_use]
    pub fn config(mut self, config: &SemaphoreConfig) -> Self {
        let keys = std::mem::take(&mut self.params.keys);
        self.params = SemaphoreParams::from_config(self.params.capacity, config);
        self.params.keys = keys;
        self
    }

    /// Validate and produce the handle. Nothing touches the store here.
    pub fn build(mut self) -> Result<DistributedSemaphore, CoordinationError> {
        let store = self
            .store
            .ok_or_else(|| CoordinationError::Config("a store is required".into()))?;
        let key = self
            .key
            .ok_or_else(|| CoordinationError::Config("a semaphore key is required".into()))?;
        self.params.capacity = self
            .capacity
            .ok_or_else(|| CoordinationError::Config("a semaphore capacity is required".into()))?;
        DistributedSemaphore::with_params(store, key, self.params)
    }
}

enum Outcome<T> {
    Done(T),
    Lost,
}

impl DistributedSemaphore {
    pub fn builder() -> DistributedSemaphoreBuilder {
        DistributedSemaphoreBuilder::default()
    }

    pub(crate) fn with_params(
        store: Arc<dyn CoordinationStore>,
        name: String,
        params: SemaphoreParams,
    ) -> Result<Self, CoordinationError> {
        if name.is_empty() {
            return Err(CoordinationError::Config(
                "semaphore key must not be empty".into(),
            ));
        }
        params.validate()?;
        let key = params.keys.semaphore(&name);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                name,
                key,
                params,
                slot: Mutex::new(Slot {
                    state: SemaphoreState::NotAcquired,
                    instance_id: None,
                    acquired_at: None,
                }),
            }),
        })
    }

    /// The semaphore key as given by the caller.
    pub fn key(&self) -> &str {
        &self.inner.name
    }

    /// The sorted-set key holding the slots.
    pub fn storage_key(&self) -> &str {
        &self.inner.key
    }

    pub fn capacity(&self) -> u32 {
        self.inner.params.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.inner.params.ttl
    }

    pub fn state(&self) -> SemaphoreState {
        self.inner.slot.lock().state
    }

    /// The id this handle holds (or last tried to hold) its slot under.
    pub fn instance_id(&self) -> Option<String> {
        self.inner.slot.lock().instance_id.clone()
    }

    /// Try to take a slot.
    ///
    /// Returns `Ok(true)` once a slot is held, including when this handle
    /// already held one (the slot is refreshed, not duplicated). A
    /// non-blocking semaphore returns `Ok(false)` when every slot is taken
    /// or the store cannot be reached. A blocking one retries with jittered
    /// backoff and fails with `SemaphoreAcquisitionTimeout` once its
    /// blocking timeout elapses.
    ///
    /// Dropping the future mid-acquire forgets the attempt and schedules
    /// removal of any slot it may have taken.
    pub async fn acquire(&self) -> Result<bool, CoordinationError> {
        let params = &self.inner.params;
        let attempt = Attempt::begin(&self.inner);
        let deadline = params.blocking_timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::new(RETRY_INITIAL, RETRY_MAX);

        loop {
            if self.inner.try_acquire(&attempt.instance_id).await {
                let (instance_id, metadata) = attempt.succeed();
                self.inner.write_metadata(&instance_id, &metadata).await;
                debug!(key = %self.inner.name, %instance_id, "semaphore slot acquired");
                return Ok(true);
            }

            if !params.blocking {
                attempt.fail();
                return Ok(false);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, params.blocking_timeout)
                && Instant::now() >= deadline
            {
                attempt.fail();
                return Err(CoordinationError::SemaphoreAcquisitionTimeout {
                    key: self.inner.name.clone(),
                    capacity: params.capacity,
                    timeout,
                });
            }

            backoff.wait(deadline).await;
        }
    }

    /// Give the slot back.
    ///
    /// Fails with `SemaphoreNotAcquired` if this handle's instance is not a
    /// member of the set (a double release, or a release without a
    /// successful acquire) and with `SemaphoreLost` if its slot expired
    /// before the release. A store error leaves the handle as it was, so the
    /// release can be retried.
    pub async fn release(&self) -> Result<(), CoordinationError> {
        let Some(instance_id) = self.instance_id() else {
            return Err(self.inner.not_acquired(String::new()));
        };

        let store = &self.inner.store;
        let now = store.now().await?;
        let score = store.sorted_score(&self.inner.key, &instance_id).await?;
        store
            .sorted_remove_by_score(&self.inner.key, f64::NEG_INFINITY, now)
            .await?;
        let removed = match score {
            Some(expires) if expires > now => {
                store.sorted_remove(&self.inner.key, &instance_id).await?
            }
            _ => false,
        };

        {
            let mut slot = self.inner.slot.lock();
            slot.state = SemaphoreState::NotAcquired;
            slot.acquired_at = None;
        }
        self.inner.delete_metadata(&instance_id).await;

        if removed {
            debug!(key = %self.inner.name, %instance_id, "semaphore slot released");
            return Ok(());
        }
        if score.is_some() {
            return Err(CoordinationError::SemaphoreLost {
                key: self.inner.name.clone(),
                instance_id,
            });
        }
        Err(self.inner.not_acquired(instance_id))
    }

    /// Refresh this handle's slot for another TTL.
    ///
    /// Returns `Ok(false)` if the slot is no longer held. Long-lived holders
    /// that do not use [`scoped`](Self::scoped) must call this more often
    /// than once per TTL.
    pub async fn renew(&self) -> Result<bool, CoordinationError> {
        self.inner.renew().await
    }

    /// Number of live holders, fleet-wide.
    pub async fn current_count(&self) -> Result<u64, CoordinationError> {
        let store = &self.inner.store;
        let now = store.now().await?;
        store
            .sorted_remove_by_score(&self.inner.key, f64::NEG_INFINITY, now)
            .await?;
        Ok(store.sorted_len(&self.inner.key).await?)
    }

    /// Free slots, fleet-wide.
    pub async fn available_count(&self) -> Result<u64, CoordinationError> {
        let current = self.current_count().await?;
        Ok(u64::from(self.inner.params.capacity).saturating_sub(current))
    }

    /// Whether this handle's instance is currently a live member of the set.
    pub async fn is_acquired(&self) -> Result<bool, CoordinationError> {
        let Some(instance_id) = self.instance_id() else {
            return Ok(false);
        };
        let store = &self.inner.store;
        let now = store.now().await?;
        let score = store.sorted_score(&self.inner.key, &instance_id).await?;
        Ok(score.is_some_and(|expires| expires > now))
    }

    /// Instance ids of the live holders, soonest expiry first.
    pub async fn holders(&self) -> Result<Vec<String>, CoordinationError> {
        let store = &self.inner.store;
        let now = store.now().await?;
        store
            .sorted_remove_by_score(&self.inner.key, f64::NEG_INFINITY, now)
            .await?;
        Ok(store
            .sorted_range_by_score(&self.inner.key, f64::NEG_INFINITY, f64::INFINITY)
            .await?)
    }

    /// The diagnostic record of one holder, if present.
    pub async fn holder_metadata(
        &self,
        instance_id: &str,
    ) -> Result<Option<HolderMetadata>, CoordinationError> {
        let key = self.inner.metadata_key(instance_id);
        let Some(raw) = self.inner.store.get(&key).await? else {
            return Ok(None);
        };
        let metadata = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Backend(format!("corrupt holder metadata at {key}: {e}"))
        })?;
        Ok(Some(metadata))
    }

    /// Run `op` while holding a slot.
    ///
    /// A failed acquire is an error here (`SemaphoreUnavailable` for a
    /// non-blocking semaphore), never a silent unguarded run. The slot is
    /// renewed every third of its TTL while `op` runs; if it is lost anyway
    /// `op` is cancelled and `SemaphoreLost` returned. The slot is released
    /// on every exit, including when this future is dropped.
    ///
    /// On a handle that already holds its slot the scope refreshes and
    /// renews that slot but leaves releasing it to the outer holder.
    pub async fn scoped<F, Fut, T, E>(&self, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let nested = self.state() == SemaphoreState::Acquired;
        if !self.acquire().await? {
            return Err(CoordinationError::SemaphoreUnavailable {
                key: self.inner.name.clone(),
                capacity: self.inner.params.capacity,
            }
            .into());
        }
        let mut held = HeldSlot::new(&self.inner, !nested);

        let renewal = RenewalTask::spawn(
            self.inner.clone(),
            renewal_interval(self.inner.params.ttl, 3),
        );
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = renewal.lost() => Outcome::Lost,
            result = op() => Outcome::Done(result),
        };
        let lost = renewal.stop().await;

        held.disarm();
        if !nested {
            match self.release().await {
                Ok(()) => {}
                Err(
                    CoordinationError::SemaphoreNotAcquired { .. }
                    | CoordinationError::SemaphoreLost { .. },
                ) if lost => {}
                Err(e) => {
                    error!(key = %self.inner.name, error = %e, "failed to release semaphore slot");
                }
            }
        }
        report_hold(
            "semaphore",
            &self.inner.name,
            started.elapsed(),
            self.inner.params.expected_hold,
        );

        match outcome {
            Outcome::Done(result) => result.map_err(GuardError::Operation),
            Outcome::Lost => {
                warn!(key = %self.inner.name, "semaphore slot lost, guarded operation cancelled");
                Err(CoordinationError::SemaphoreLost {
                    key: self.inner.name.clone(),
                    instance_id: held.instance_id.clone(),
                }
                .into())
            }
        }
    }
}

impl Inner {
    fn ttl_secs(&self) -> f64 {
        self.params.ttl.as_secs_f64()
    }

    fn metadata_key(&self, instance_id: &str) -> String {
        self.params.keys.semaphore_holder(&self.name, instance_id)
    }

    fn not_acquired(&self, instance_id: String) -> CoordinationError {
        CoordinationError::SemaphoreNotAcquired {
            key: self.name.clone(),
            instance_id,
        }
    }

    /// One admission attempt. Never fails: errors mean "not acquired".
    async fn try_acquire(&self, instance_id: &str) -> bool {
        match self.acquire_atomic(instance_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(
                    key = %self.name,
                    error = %e,
                    "atomic semaphore admission failed, falling back to check-then-add"
                );
                match self.acquire_fallback(instance_id).await {
                    Ok(acquired) => acquired,
                    Err(e) => {
                        warn!(key = %self.name, error = %e, "semaphore admission failed");
                        false
                    }
                }
            }
        }
    }

    async fn acquire_atomic(&self, instance_id: &str) -> Result<bool, StoreError> {
        let now = self.store.now().await?;
        let score = now + self.ttl_secs();
        self.store
            .sorted_remove_by_score(&self.key, f64::NEG_INFINITY, now)
            .await?;
        if self
            .store
            .sorted_renew(&self.key, instance_id, score, now)
            .await?
        {
            debug!(key = %self.name, instance_id, "semaphore slot refreshed");
            return Ok(true);
        }
        self.store
            .sorted_add_bounded(&self.key, instance_id, score, now, self.params.capacity)
            .await
    }

    async fn acquire_fallback(&self, instance_id: &str) -> Result<bool, StoreError> {
        let now = self.store.now().await?;
        let score = now + self.ttl_secs();
        self.store
            .sorted_remove_by_score(&self.key, f64::NEG_INFINITY, now)
            .await?;
        let member = self.store.sorted_score(&self.key, instance_id).await?;
        if member.is_none()
            && self.store.sorted_len(&self.key).await? >= u64::from(self.params.capacity)
        {
            return Ok(false);
        }
        self.store.sorted_add(&self.key, instance_id, score).await?;
        Ok(true)
    }

    async fn renew_slot(&self, instance_id: &str) -> Result<bool, StoreError> {
        let now = self.store.now().await?;
        let score = now + self.ttl_secs();
        match self
            .store
            .sorted_renew(&self.key, instance_id, score, now)
            .await
        {
            Err(e) if e.is_script() => {
                let live = self
                    .store
                    .sorted_score(&self.key, instance_id)
                    .await?
                    .is_some_and(|expires| expires > now);
                if live {
                    self.store.sorted_add(&self.key, instance_id, score).await?;
                }
                Ok(live)
            }
            other => other,
        }
    }

    async fn write_metadata(&self, instance_id: &str, metadata: &HolderMetadata) {
        let key = self.metadata_key(instance_id);
        let raw = match serde_json::to_string(metadata) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.name, error = %e, "failed to encode holder metadata");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, &raw, self.params.ttl).await {
            warn!(key = %self.name, error = %e, "failed to write holder metadata");
        }
    }

    async fn delete_metadata(&self, instance_id: &str) {
        if let Err(e) = self.store.delete(&self.metadata_key(instance_id)).await {
            warn!(key = %self.name, error = %e, "failed to delete holder metadata");
        }
    }

    fn metadata(&self, instance_id: &str, acquired_at: DateTime<Utc>) -> HolderMetadata {
        HolderMetadata {
            key: self.name.clone(),
            instance_id: instance_id.to_owned(),
            capacity: self.params.capacity,
            acquired_at,
        }
    }

    /// Schedule best-effort removal of a slot nobody will release.
    fn abandon(&self, instance_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let metadata_key = self.metadata_key(&instance_id);
        runtime.spawn(async move {
            if let Err(e) = store.sorted_remove(&key, &instance_id).await {
                warn!(key = %key, error = %e, "failed to remove abandoned semaphore slot");
            }
            if let Err(e) = store.delete(&metadata_key).await {
                warn!(key = %key, error = %e, "failed to delete abandoned holder metadata");
            }
        });
    }
}

#[async_trait]
impl Lease for Inner {
    fn name(&self) -> &str {
        &self.name
    }

    fn ttl(&self) -> Duration {
        self.params.ttl
    }

    async fn renew(&self) -> Result<bool, CoordinationError> {
        let (instance_id, acquired_at) = {
            let slot = self.slot.lock();
            match (&slot.instance_id, slot.acquired_at, slot.state) {
                (Some(id), Some(at), SemaphoreState::Acquired) => (id.clone(), at),
                _ => return Ok(false),
            }
        };
        if !self.renew_slot(&instance_id).await? {
            return Ok(false);
        }
        self.write_metadata(&instance_id, &self.metadata(&instance_id, acquired_at))
            .await;
        Ok(true)
    }
}

/// One in-flight `acquire()`. Resets the handle if dropped unfinished.
struct Attempt<'a> {
    inner: &'a Inner,
    instance_id: String,
    was_held: bool,
    finished: bool,
}

impl<'a> Attempt<'a> {
    fn begin(inner: &'a Inner) -> Self {
        let mut slot = inner.slot.lock();
        let was_held = slot.state == SemaphoreState::Acquired;
        let instance_id = match (&slot.instance_id, slot.state) {
            (Some(id), SemaphoreState::Acquired | SemaphoreState::Acquiring) => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        slot.instance_id = Some(instance_id.clone());
        if !was_held {
            slot.state = SemaphoreState::Acquiring;
        }
        drop(slot);
        Self {
            inner,
            instance_id,
            was_held,
            finished: false,
        }
    }

    fn succeed(mut self) -> (String, HolderMetadata) {
        self.finished = true;
        let mut slot = self.inner.slot.lock();
        slot.state = SemaphoreState::Acquired;
        let acquired_at = *slot.acquired_at.get_or_insert_with(Utc::now);
        drop(slot);
        let metadata = self.inner.metadata(&self.instance_id, acquired_at);
        (std::mem::take(&mut self.instance_id), metadata)
    }

    /// A failed refresh keeps the slot this handle already held; it is
    /// still in the set until its own TTL runs out.
    fn fail(mut self) {
        self.finished = true;
        if self.was_held {
            return;
        }
        let mut slot = self.inner.slot.lock();
        slot.state = SemaphoreState::NotAcquired;
        slot.acquired_at = None;
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.finished || self.was_held {
            return;
        }
        {
            let mut slot = self.inner.slot.lock();
            slot.state = SemaphoreState::NotAcquired;
            slot.acquired_at = None;
        }
        self.inner.abandon(std::mem::take(&mut self.instance_id));
    }
}

/// Releases a scoped slot if the scope is dropped before it finishes.
struct HeldSlot<'a> {
    inner: &'a Inner,
    instance_id: String,
    armed: bool,
}

impl<'a> HeldSlot<'a> {
    fn new(inner: &'a Inner, armed: bool) -> Self {
        let instance_id = inner.slot.lock().instance_id.clone().unwrap_or_default();
        Self {
            inner,
            instance_id,
            armed,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for HeldSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut slot = self.inner.slot.lock();
            slot.state = SemaphoreState::NotAcquired;
            slot.acquired_at = None;
        }
        self.inner.abandon(self.instance_id.clone());
    }
}
