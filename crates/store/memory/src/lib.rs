//! In-memory coordination store for fleetlock.
//!
//! Useful for tests and single-process deployments. Exclusivity only holds
//! within the process that owns the store.

mod store;

pub use store::{FaultMode, MemoryCoordinationStore};
