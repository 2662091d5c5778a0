//! Distributed coordination primitives for a fleet of stateless replicas.
//!
//! Every replica shares one [`CoordinationStore`]; all cross-replica safety
//! is delegated to its atomic operations, so one store handle can be shared
//! by any number of guards and semaphores without client-side locking.
//!
//! - [`ExclusiveGuard`]: at most one execution per key across the fleet.
//!   Store errors during acquisition propagate.
//! - [`DistributedSemaphore`]: at most `capacity` holders per key across the
//!   fleet. A store error during acquisition reads as "not acquired".
//! - [`SemaphoreLimited`]: the semaphore applied to a family of keys derived
//!   from each call's arguments.
//!
//! Both primitives are lease based. A held lease is renewed by a child task
//! bound to the protected operation; if renewal finds the lease gone the
//! operation is cancelled and the caller gets a `LockLost` /
//! `SemaphoreLost` error. Leases are never held past their TTL, even
//! across a crash, but a renewal delayed beyond the TTL does lose
//! ownership.

pub mod config;
pub mod error;
pub mod exclusive;
pub mod keys;
pub mod lease;
pub mod limited;
pub mod resolve;
pub mod semaphore;

pub use config::{LockConfig, SemaphoreConfig, SyncConfig};
pub use error::{CoordinationError, GuardError};
pub use exclusive::{ExclusiveGuard, ExclusiveGuardBuilder};
pub use fleetlock_store::{CoordinationStore, StoreError};
pub use keys::KeySpace;
pub use lease::{Backoff, Lease, RenewalTask};
pub use limited::{SemaphoreLimited, SemaphoreLimitedBuilder};
pub use resolve::{KeySource, StoreSource};
pub use semaphore::{
    DistributedSemaphore, DistributedSemaphoreBuilder, HolderMetadata, SemaphoreState,
};
