use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// The backing key-value store shared by every replica.
///
/// All cross-replica safety lives behind this trait: conditional writes are
/// atomic on the store side, so a single handle can be shared (`Arc<dyn
/// CoordinationStore>`) by any number of locks and semaphores without any
/// client-side locking.
///
/// Sorted-set scores are expiry epochs in seconds, measured against
/// [`now`](CoordinationStore::now).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// The store's clock as seconds since the Unix epoch.
    async fn now(&self) -> Result<f64, StoreError>;

    /// Set `key` to `value` with a TTL only if the key does not exist.
    /// Returns `true` if the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Get the value of a key. Returns `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with a TTL, overwriting any previous value.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Take a fenced lease: if `key` does not exist, set it to `value` and
    /// `fence_key` to `token`, both with `ttl`, in one step.
    ///
    /// `value` is what observers see under `key`; `token` identifies this
    /// particular acquisition. Returns `true` if the lease was taken.
    async fn set_fenced_if_absent(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Reset the TTL of both keys only if `key` still holds `value` and
    /// `fence_key` still holds `token`.
    async fn extend_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop a fenced lease. Nothing happens unless `fence_key` holds `token`;
    /// then `fence_key` is deleted, and `key` too if it still holds `value`.
    ///
    /// Returns `true` if `key` was deleted.
    async fn delete_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
    ) -> Result<bool, StoreError>;

    /// Add `member` with `score`, replacing any previous score.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Remove `member`. Returns `true` if it was present.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Score of `member`, if present.
    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Number of members in the set.
    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Members whose score lies in `[min, max]`, lowest score first.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove members whose score lies in `[min, max]`. Returns how many
    /// were removed.
    async fn sorted_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError>;

    /// Atomically prune members scored at or below `now`, then add `member`
    /// with `score` if fewer than `capacity` members remain.
    ///
    /// Returns `true` if the member was added. Backends must evaluate the
    /// count and the add as one step on the store side.
    async fn sorted_add_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
        capacity: u32,
    ) -> Result<bool, StoreError>;

    /// Atomically refresh the score of `member` to `score` if it is present
    /// and not yet expired at `now`. An expired member is removed instead.
    ///
    /// Returns `true` if the score was refreshed.
    async fn sorted_renew(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
    ) -> Result<bool, StoreError>;
}
