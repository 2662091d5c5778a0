//! Fleet-wide exclusive execution.
//!
//! [`ExclusiveGuard`] wraps an async operation so that, across every replica
//! sharing the store, at most one execution per key runs at a time. The
//! lease is a single key with a TTL, renewed every half TTL while the
//! operation runs. Losing it cancels the operation.
//!
//! Each run also writes a random owner token to a sibling fence key.
//! Renewal and release check both the lock value and that token, so two
//! runs configured with the same static value never mistake each other's
//! lease for their own.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetlock_store::CoordinationStore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{CoordinationError, GuardError};
use crate::keys::KeySpace;
use crate::lease::{Backoff, Lease, RenewalTask, renewal_interval, report_hold};
use crate::resolve::{KeySource, StoreSource};

const RETRY_INITIAL: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(1);

/// Guarded execution of operations taking arguments of type `A`.
///
/// Both the store and the key can be fixed or derived from each call's
/// arguments, so one guard can protect a parametric family of keys.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fleetlock_sync::{CoordinationError, ExclusiveGuard};
/// # async fn demo(store: Arc<dyn fleetlock_store::CoordinationStore>) -> Result<(), CoordinationError> {
/// let guard = ExclusiveGuard::builder()
///     .store(store)
///     .key_fn(|tenant: &String| format!("reindex:{tenant}"))
///     .blocking(false)
///     .build()?;
///
/// let rows = guard
///     .run("acme".to_owned(), |tenant| async move {
///         Ok::<_, std::io::Error>(tenant.len())
///     })
///     .await;
/// # let _ = rows;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ExclusiveGuard<A> {
    store: StoreSource<A>,
    key: KeySource<A>,
    value: Option<String>,
    blocking: bool,
    blocking_timeout: Option<Duration>,
    ttl: Duration,
    expected_hold: Duration,
    keys: KeySpace,
}

/// Fluent builder for [`ExclusiveGuard`].
///
/// A store and a key are required. Defaults come from
/// [`LockConfig::default`]; guards are blocking unless told otherwise.
pub struct ExclusiveGuardBuilder<A> {
    store: Option<StoreSource<A>>,
    key: Option<KeySource<A>>,
    value: Option<String>,
    blocking: bool,
    blocking_timeout: Option<Duration>,
    ttl: Duration,
    expected_hold: Duration,
    keys: KeySpace,
}

impl<A> Default for ExclusiveGuardBuilder<A> {
    fn default() -> Self {
        let config = LockConfig::default();
        Self {
            store: None,
            key: None,
            value: None,
            blocking: true,
            blocking_timeout: config.blocking_timeout(),
            ttl: config.ttl(),
            expected_hold: config.expected_hold(),
            keys: KeySpace::default(),
        }
    }
}

impl<A> ExclusiveGuardBuilder<A> {
    /// Use one shared store for every call.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(StoreSource::shared(store));
        self
    }

    /// Pick the store from each call's arguments.
    #[must_use]
    pub fn store_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> Arc<dyn CoordinationStore> + Send + Sync + 'static,
    {
        self.store = Some(StoreSource::resolver(f));
        self
    }

    /// Protect a single literal key.
    #[must_use]
    pub fn key(mut self, key: impl Into<KeySource<A>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Derive the key from each call's arguments.
    #[must_use]
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key = Some(KeySource::derived(f));
        self
    }

    /// Store this value under the lock key instead of a random token.
    #[must_use]
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Bound the wait of a blocking guard. `None` waits forever.
    #[must_use]
    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn expected_hold(mut self, expected: Duration) -> Self {
        self.expected_hold = expected;
        self
    }

    #[must_use]
    pub fn key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    /// Take ttl, blocking timeout and expected hold from a config section.
    #[must_use]
    pub fn config(mut self, config: &LockConfig) -> Self {
        self.ttl = config.ttl();
        self.blocking_timeout = config.blocking_timeout();
        self.expected_hold = config.expected_hold();
        self
    }

    /// Validate and produce the guard. Nothing touches the store here.
    pub fn build(self) -> Result<ExclusiveGuard<A>, CoordinationError> {
        let store = self
            .store
            .ok_or_else(|| CoordinationError::Config("a store is required".into()))?;
        let key = self
            .key
            .ok_or_else(|| CoordinationError::Config("a lock key is required".into()))?;
        key.validate()?;

        if self.ttl.is_zero() {
            return Err(CoordinationError::Config("lock ttl must be positive".into()));
        }
        if self.blocking_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CoordinationError::Config(
                "lock blocking timeout must be positive".into(),
            ));
        }
        if self.value.as_deref() == Some("") {
            return Err(CoordinationError::Config(
                "lock value must not be empty".into(),
            ));
        }

        Ok(ExclusiveGuard {
            store,
            key,
            value: self.value,
            blocking: self.blocking,
            blocking_timeout: self.blocking_timeout,
            ttl: self.ttl,
            expected_hold: self.expected_hold,
            keys: self.keys,
        })
    }
}

enum Outcome<T> {
    Done(T),
    Lost,
    Cancelled,
}

impl<A> ExclusiveGuard<A> {
    pub fn builder() -> ExclusiveGuardBuilder<A> {
        ExclusiveGuardBuilder::default()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How often a held lease is renewed.
    pub fn renewal_interval(&self) -> Duration {
        renewal_interval(self.ttl, 2)
    }

    /// Run `op` while holding the lock resolved from `args`.
    ///
    /// Returns the operation's result, or its error as
    /// [`GuardError::Operation`]. Fails with `LockNotAcquired` /
    /// `LockAcquisitionTimeout` if the lock cannot be taken, and with
    /// `LockLost` if the lease was lost mid-flight, in which case the
    /// operation has been cancelled. Store errors during acquisition
    /// propagate as `Store`.
    ///
    /// Dropping the returned future stops renewal and schedules a release.
    pub async fn run<F, Fut, T, E>(&self, args: A, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(args, op, None).await
    }

    /// Like [`run`](Self::run), but stops when `cancel` fires.
    ///
    /// On cancellation the operation is dropped, renewal is stopped and
    /// joined, the lease is released, and only then is `Cancelled`
    /// returned.
    pub async fn run_until_cancelled<F, Fut, T, E>(
        &self,
        args: A,
        op: F,
        cancel: &CancellationToken,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(args, op, Some(cancel)).await
    }

    async fn execute<F, Fut, T, E>(
        &self,
        args: A,
        op: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = self.key.resolve(&args)?;
        let store = self.store.resolve(&args);
        let handle = self.acquire(store, name, cancel).await?;

        let renewal = RenewalTask::spawn(handle.clone(), self.renewal_interval());
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = cancelled(cancel) => Outcome::Cancelled,
            () = renewal.lost() => Outcome::Lost,
            result = op(args) => Outcome::Done(result),
        };

        renewal.stop().await;
        handle.release().await;
        report_hold("lock", &handle.name, started.elapsed(), self.expected_hold);

        match outcome {
            Outcome::Done(result) => result.map_err(GuardError::Operation),
            Outcome::Lost => {
                warn!(key = %handle.name, "lock lost, guarded operation cancelled");
                Err(CoordinationError::LockLost {
                    key: handle.name.clone(),
                }
                .into())
            }
            Outcome::Cancelled => Err(CoordinationError::Cancelled.into()),
        }
    }

    async fn acquire(
        &self,
        store: Arc<dyn CoordinationStore>,
        name: String,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<LockHandle>, CoordinationError> {
        let key = self.keys.lock(&name);
        let fence_key = self.keys.lock_owner(&name);
        let token = uuid::Uuid::new_v4().to_string();
        let value = self
            .value
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let deadline = self.blocking_timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::new(RETRY_INITIAL, RETRY_MAX);

        loop {
            if store
                .set_fenced_if_absent(&key, &value, &fence_key, &token, self.ttl)
                .await?
            {
                debug!(key = %name, "lock acquired");
                return Ok(Arc::new(LockHandle {
                    store,
                    key,
                    fence_key,
                    name,
                    value,
                    token,
                    ttl: self.ttl,
                    held: AtomicBool::new(true),
                }));
            }

            if !self.blocking {
                info!(key = %name, "lock held elsewhere");
                return Err(CoordinationError::LockNotAcquired { key: name });
            }
            if let (Some(deadline), Some(timeout)) = (deadline, self.blocking_timeout)
                && Instant::now() >= deadline
            {
                return Err(CoordinationError::LockAcquisitionTimeout { key: name, timeout });
            }

            tokio::select! {
                () = cancelled(cancel) => return Err(CoordinationError::Cancelled),
                () = backoff.wait(deadline) => {}
            }
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// One acquisition of an exclusive lease.
struct LockHandle {
    store: Arc<dyn CoordinationStore>,
    key: String,
    fence_key: String,
    name: String,
    value: String,
    token: String,
    ttl: Duration,
    held: AtomicBool,
}

impl LockHandle {
    /// Release the lease if still held. Never fails; a second call is a
    /// no-op.
    async fn release(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            return;
        }
        match self
            .store
            .delete_fenced(&self.key, &self.value, &self.fence_key, &self.token)
            .await
        {
            Ok(true) => debug!(key = %self.name, "lock released"),
            Ok(false) => debug!(key = %self.name, "lock already gone at release"),
            Err(e) => warn!(key = %self.name, error = %e, "failed to release lock"),
        }
    }
}

#[async_trait]
impl Lease for LockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn renew(&self) -> Result<bool, CoordinationError> {
        Ok(self
            .store
            .extend_fenced(&self.key, &self.value, &self.fence_key, &self.token, self.ttl)
            .await?)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !*self.held.get_mut() {
            return;
        }
        // Dropped mid-flight (the run future was aborted). The TTL bounds the
        // lease if no runtime is left to release it.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            let fence_key = std::mem::take(&mut self.fence_key);
            let value = std::mem::take(&mut self.value);
            let token = std::mem::take(&mut self.token);
            runtime.spawn(async move {
                if let Err(e) = store.delete_fenced(&key, &value, &fence_key, &token).await {
                    warn!(key = %key, error = %e, "failed to release abandoned lock");
                }
            });
        }
    }
}
