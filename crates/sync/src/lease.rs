//! Lease renewal shared by exclusive locks and semaphore slots.
//!
//! A lease is only valid while it is renewed. [`RenewalTask`] is the child
//! task that keeps a lease alive while its owner works: it is spawned when
//! the lease is acquired, stopped and joined on every normal exit, and
//! aborted if the owning future is dropped. It never outlives its owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoordinationError;

/// Lower bound on the renewal period, whatever the TTL.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(10);

/// A time-bounded ownership claim that can be refreshed.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Human-readable name of the claimed resource, for logs.
    fn name(&self) -> &str;

    /// How long the claim survives without renewal.
    fn ttl(&self) -> Duration;

    /// Refresh the claim. `Ok(false)` means it is no longer owned.
    async fn renew(&self) -> Result<bool, CoordinationError>;
}

/// Renewal period for a lease with the given TTL, woken `per_ttl` times
/// per TTL.
pub fn renewal_interval(ttl: Duration, per_ttl: u32) -> Duration {
    (ttl / per_ttl.max(1)).max(MIN_RENEWAL_INTERVAL)
}

/// A background loop refreshing a lease until stopped or lost.
///
/// A renewal that reports the lease gone marks it lost at once. A renewal
/// that errors (store unreachable) is retried on the next tick; once a full
/// TTL has passed without a successful renewal the store has expired the
/// lease, so it is marked lost too.
#[derive(Debug)]
pub struct RenewalTask {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RenewalTask {
    /// Spawn the renewal loop for `lease`, ticking every `interval`.
    pub fn spawn(lease: Arc<dyn Lease>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let handle = tokio::spawn(renew_loop(lease, interval, stop.clone(), lost.clone()));
        Self {
            stop,
            lost,
            handle: Some(handle),
        }
    }

    /// Resolves once the lease has been declared lost. Never resolves for a
    /// lease that is kept.
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing and wait for the loop to exit.
    ///
    /// Returns `true` if the lease had been lost before the stop.
    pub async fn stop(mut self) -> bool {
        self.stop.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && e.is_panic()
        {
            warn!(error = %e, "lease renewal task panicked");
        }
        self.lost.is_cancelled()
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn renew_loop(
    lease: Arc<dyn Lease>,
    interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            () = stop.cancelled() => return,
            outcome = lease.renew() => outcome,
        };

        match outcome {
            Ok(true) => {
                last_renewed = Instant::now();
                debug!(lease = lease.name(), "lease renewed");
            }
            Ok(false) => {
                warn!(lease = lease.name(), "lease no longer owned");
                lost.cancel();
                return;
            }
            Err(e) if last_renewed.elapsed() >= lease.ttl() => {
                warn!(
                    lease = lease.name(),
                    error = %e,
                    "lease renewal kept failing past its ttl"
                );
                lost.cancel();
                return;
            }
            Err(e) => {
                warn!(lease = lease.name(), error = %e, "lease renewal failed, will retry");
            }
        }
    }
}

/// Exponential retry delay with random jitter.
///
/// Each delay is drawn uniformly between the initial delay and a ceiling
/// that doubles per attempt up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            ceiling: initial,
        }
    }

    /// The next delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let low = duration_millis(self.initial);
        let high = duration_millis(self.ceiling);
        self.ceiling = self.ceiling.saturating_mul(2).min(self.max);
        let millis = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            low
        };
        Duration::from_millis(millis)
    }

    /// Sleep for the next delay, cut short at `deadline` if one is set.
    pub async fn wait(&mut self, deadline: Option<Instant>) {
        let mut delay = self.next_delay();
        if let Some(deadline) = deadline {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }
        tokio::time::sleep(delay).await;
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Log a warning when a critical section ran longer than expected.
pub(crate) fn report_hold(kind: &'static str, key: &str, held: Duration, expected: Duration) {
    if held > expected {
        warn!(
            kind,
            key,
            held_ms = duration_millis(held),
            expected_ms = duration_millis(expected),
            "held longer than expected; consider shortening the critical section or raising the expected hold time"
        );
    }
}
