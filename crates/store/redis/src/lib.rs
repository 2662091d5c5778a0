//! Redis coordination store for fleetlock.
//!
//! This crate provides a Redis-backed implementation of the
//! [`CoordinationStore`] trait from `fleetlock-store`.
//!
//! # Features
//!
//! - **Fenced leases**: the lock key and an owner-token key are written,
//!   extended and deleted together by Lua scripts, so only the acquisition
//!   that wrote the token can renew or release, even when several holders
//!   store the same lock value.
//! - **Bounded sorted sets**: prune, count and add in one Lua script, so two
//!   replicas can never both observe room and both take the last slot.
//! - **Store clock**: `TIME` gives every replica the same notion of "now"
//!   for sorted-set expiry scores.
//! - **Connection pooling**: Uses `deadpool-redis` for efficient connection
//!   management.
//!
//! # Consistency
//!
//! | Deployment | Mutual Exclusion | Notes |
//! |------------|------------------|-------|
//! | Single instance | Strong | Full mutual exclusion guaranteed |
//! | Sentinel | Weak | A lease may be lost during failover |
//! | Cluster | Weak | A lease may be lost during failover |
//!
//! Replication is asynchronous: if the primary fails right after a lease
//! is written, the promoted replica may not have it. Leases are bounded by
//! their TTL either way.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleetlock_store_redis::{RedisConfig, RedisCoordinationStore};
//!
//! let config = RedisConfig::new("redis://localhost:6379");
//! let store = Arc::new(RedisCoordinationStore::new(&config)?);
//! ```
//!
//! [`CoordinationStore`]: fleetlock_store::CoordinationStore

mod config;
mod scripts;
mod store;

pub use config::RedisConfig;
pub use store::RedisCoordinationStore;
