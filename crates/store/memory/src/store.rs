use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use fleetlock_store::error::StoreError;
use fleetlock_store::store::CoordinationStore;

/// A plain key with its expiry deadline.
#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Instant,
}

impl ValueEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Simulated store faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultMode {
    /// Behave normally.
    #[default]
    None,
    /// Scripted operations (the fenced lease operations,
    /// `sorted_add_bounded`, `sorted_renew`) fail with
    /// [`StoreError::Script`]; plain commands still work.
    ScriptsFail,
    /// Every operation fails with [`StoreError::Connection`].
    Unavailable,
}

/// In-memory [`CoordinationStore`] backed by [`DashMap`]s.
///
/// Plain keys expire lazily on access. The clock is driven by
/// [`tokio::time::Instant`], so tests running with a paused runtime clock see
/// both key TTLs and [`now`](CoordinationStore::now) advance together.
///
/// Conditional operations hold the per-key shard lock for their whole
/// duration, which gives them the same atomicity as a server-side script.
/// Fenced lease operations touch two keys and are serialized by one extra
/// mutex instead.
#[derive(Debug)]
pub struct MemoryCoordinationStore {
    values: DashMap<String, ValueEntry>,
    sorted: DashMap<String, HashMap<String, f64>>,
    fenced: Mutex<()>,
    epoch_origin: f64,
    clock_origin: Instant,
    fault: Mutex<FaultMode>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        let epoch_origin = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        Self {
            values: DashMap::new(),
            sorted: DashMap::new(),
            fenced: Mutex::new(()),
            epoch_origin,
            clock_origin: Instant::now(),
            fault: Mutex::new(FaultMode::None),
        }
    }
}

impl MemoryCoordinationStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the simulated fault mode.
    pub fn set_fault_mode(&self, mode: FaultMode) {
        *self.fault.lock() = mode;
    }

    /// The current simulated fault mode.
    pub fn fault_mode(&self) -> FaultMode {
        *self.fault.lock()
    }

    fn check(&self, scripted: bool) -> Result<(), StoreError> {
        match *self.fault.lock() {
            FaultMode::None => Ok(()),
            FaultMode::Unavailable => Err(StoreError::Connection(
                "simulated store outage".to_owned(),
            )),
            FaultMode::ScriptsFail if scripted => Err(StoreError::Script(
                "simulated script failure".to_owned(),
            )),
            FaultMode::ScriptsFail => Ok(()),
        }
    }

    fn clock(&self) -> f64 {
        self.epoch_origin + self.clock_origin.elapsed().as_secs_f64()
    }

    fn holds(&self, key: &str, value: &str) -> bool {
        self.values
            .get(key)
            .is_some_and(|entry| !entry.is_expired() && entry.value == value)
    }

    /// Drop an emptied sorted set, as Redis does.
    fn drop_if_empty(&self, key: &str) {
        self.sorted.remove_if(key, |_, set| set.is_empty());
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn now(&self) -> Result<f64, StoreError> {
        self.check(false)?;
        Ok(self.clock())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check(false)?;

        // Remove expired entries lazily.
        self.values.remove_if(key, |_, entry| entry.is_expired());

        match self.values.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ValueEntry {
                    value: value.to_owned(),
                    expires_at: Instant::now() + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check(false)?;

        if let Some(entry) = self.values.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.values.remove_if(key, |_, entry| entry.is_expired());
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check(false)?;
        self.values.insert(
            key.to_owned(),
            ValueEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check(false)?;
        let value_removed = self
            .values
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired());
        let set_removed = self.sorted.remove(key).is_some();
        Ok(value_removed || set_removed)
    }

    async fn set_fenced_if_absent(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check(true)?;
        let _serial = self.fenced.lock();

        self.values.remove_if(key, |_, entry| entry.is_expired());
        let expires_at = Instant::now() + ttl;
        match self.values.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ValueEntry {
                    value: value.to_owned(),
                    expires_at,
                });
            }
        }
        self.values.insert(
            fence_key.to_owned(),
            ValueEntry {
                value: token.to_owned(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn extend_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check(true)?;
        let _serial = self.fenced.lock();

        if !self.holds(key, value) || !self.holds(fence_key, token) {
            return Ok(false);
        }
        let expires_at = Instant::now() + ttl;
        for k in [key, fence_key] {
            if let Some(mut entry) = self.values.get_mut(k) {
                entry.expires_at = expires_at;
            }
        }
        Ok(true)
    }

    async fn delete_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
    ) -> Result<bool, StoreError> {
        self.check(true)?;
        let _serial = self.fenced.lock();

        if !self.holds(fence_key, token) {
            return Ok(false);
        }
        self.values.remove(fence_key);
        if !self.holds(key, value) {
            return Ok(false);
        }
        self.values.remove(key);
        Ok(true)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check(false)?;
        self.sorted
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check(false)?;
        let removed = self
            .sorted
            .get_mut(key)
            .is_some_and(|mut set| set.remove(member).is_some());
        self.drop_if_empty(key);
        Ok(removed)
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.check(false)?;
        Ok(self
            .sorted
            .get(key)
            .and_then(|set| set.get(member).copied()))
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check(false)?;
        Ok(self.sorted.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.check(false)?;
        let Some(set) = self.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn sorted_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.check(false)?;
        let removed = self.sorted.get_mut(key).map_or(0, |mut set| {
            let before = set.len();
            set.retain(|_, score| *score < min || *score > max);
            (before - set.len()) as u64
        });
        self.drop_if_empty(key);
        Ok(removed)
    }

    async fn sorted_add_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
        capacity: u32,
    ) -> Result<bool, StoreError> {
        self.check(true)?;

        let added = {
            let mut set = self.sorted.entry(key.to_owned()).or_default();
            set.retain(|_, s| *s > now);
            if set.contains_key(member) || set.len() < capacity as usize {
                set.insert(member.to_owned(), score);
                true
            } else {
                false
            }
        };
        self.drop_if_empty(key);
        Ok(added)
    }

    async fn sorted_renew(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
    ) -> Result<bool, StoreError> {
        self.check(true)?;

        let renewed = {
            let Some(mut set) = self.sorted.get_mut(key) else {
                return Ok(false);
            };
            match set.get(member).copied() {
                Some(current) if current > now => {
                    set.insert(member.to_owned(), score);
                    true
                }
                Some(_) => {
                    set.remove(member);
                    false
                }
                None => false,
            }
        };
        self.drop_if_empty(key);
        Ok(renewed)
    }
}

#[cfg(test)]
mod tests {
    use fleetlock_store::testing::run_store_conformance_tests;

    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryCoordinationStore::new();
        run_store_conformance_tests(&store, "conformance")
            .await
            .expect("store conformance tests should pass");
    }

    #[tokio::test(start_paused = true)]
    async fn key_expires_after_ttl() {
        let store = MemoryCoordinationStore::new();
        assert!(
            store
                .set_fenced_if_absent("k", "v", "k:owner", "t1", Duration::from_secs(2))
                .await
                .unwrap()
        );

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.get("k:owner").await.unwrap().is_none());
        assert!(
            store
                .set_if_absent("k", "w", Duration::from_secs(2))
                .await
                .unwrap(),
            "should acquire after TTL expiry"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_runtime_time() {
        let store = MemoryCoordinationStore::new();
        let before = store.now().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let after = store.now().await.unwrap();
        assert!((after - before - 30.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn scripts_fail_mode_only_affects_scripts() {
        let store = MemoryCoordinationStore::new();
        store.set_fault_mode(FaultMode::ScriptsFail);

        let err = store
            .sorted_add_bounded("s", "m", 10.0, 1.0, 1)
            .await
            .unwrap_err();
        assert!(err.is_script());

        store.sorted_add("s", "m", 10.0).await.unwrap();
        assert_eq!(store.sorted_len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_mode_fails_everything() {
        let store = MemoryCoordinationStore::new();
        store.set_fault_mode(FaultMode::Unavailable);

        assert!(store.now().await.unwrap_err().is_connectivity());
        assert!(store.get("k").await.unwrap_err().is_connectivity());

        store.set_fault_mode(FaultMode::None);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bounded_add_is_atomic_under_contention() {
        let store = std::sync::Arc::new(MemoryCoordinationStore::new());
        let now = store.now().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .sorted_add_bounded("pool", &format!("m{i}"), now + 60.0, now, 7)
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
        assert_eq!(store.sorted_len("pool").await.unwrap(), 7);
    }
}
