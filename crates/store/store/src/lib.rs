//! Backing store contract for the fleetlock coordination primitives.
//!
//! Every replica talks to one shared key-value store. The primitives in
//! `fleetlock-sync` only ever reach it through [`CoordinationStore`], which
//! exposes plain keys with expiry, fenced leases (a lock key and an owner
//! token written, extended and deleted together), sorted sets, and two
//! atomic scripted operations on sorted sets that bounded holders depend on.
//!
//! Backends: `fleetlock-store-memory` (in-process, for tests and single-node
//! use) and `fleetlock-store-redis`.

pub mod error;
pub mod store;
pub mod testing;

pub use error::StoreError;
pub use store::CoordinationStore;
