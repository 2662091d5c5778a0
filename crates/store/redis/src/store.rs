use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, RedisError, Script};

use fleetlock_store::error::StoreError;
use fleetlock_store::store::CoordinationStore;

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`CoordinationStore`].
///
/// Plain keys use `SET NX PX` / `SET PX`; every conditional write is a Lua
/// script, so it runs atomically on the server. Scripts are loaded lazily
/// (`EVALSHA` with an `EVAL` fallback handled by [`Script`]).
pub struct RedisCoordinationStore {
    pool: Pool,
    set_fenced: Script,
    extend_fenced: Script,
    delete_fenced: Script,
    add_bounded: Script,
    renew_member: Script,
}

impl RedisCoordinationStore {
    /// Create a new `RedisCoordinationStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout()))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            set_fenced: Script::new(scripts::SET_FENCED_IF_ABSENT),
            extend_fenced: Script::new(scripts::EXTEND_FENCED),
            delete_fenced: Script::new(scripts::DELETE_FENCED),
            add_bounded: Script::new(scripts::ADD_BOUNDED),
            renew_member: Script::new(scripts::RENEW_MEMBER),
        })
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

fn is_transport(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Map a command error, keeping transport faults distinct.
fn command_err(e: RedisError) -> StoreError {
    if is_transport(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Map a script invocation error, keeping transport faults distinct.
fn script_err(e: RedisError) -> StoreError {
    if is_transport(&e) {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Script(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Render a score bound, spelling out infinities the way Redis expects.
fn score_bound(v: f64) -> String {
    if v == f64::INFINITY {
        "+inf".to_owned()
    } else if v == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        v.to_string()
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn now(&self) -> Result<f64, StoreError> {
        let mut conn = self.conn().await?;
        let (secs, micros): (u64, u64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        #[allow(clippy::cast_precision_loss)]
        let now = secs as f64 + micros as f64 / 1_000_000.0;
        Ok(now)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(command_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(command_err)?;
        Ok(removed > 0)
    }

    async fn set_fenced_if_absent(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .set_fenced
            .key(key)
            .key(fence_key)
            .arg(value)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(result == 1)
    }

    async fn extend_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .extend_fenced
            .key(key)
            .key(fence_key)
            .arg(value)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(result == 1)
    }

    async fn delete_fenced(
        &self,
        key: &str,
        value: &str,
        fence_key: &str,
        token: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .delete_fenced
            .key(key)
            .key(fence_key)
            .arg(value)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(result == 1)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(removed > 0)
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn sorted_remove_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn sorted_add_bounded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
        capacity: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .add_bounded
            .key(key)
            .arg(member)
            .arg(score)
            .arg(now)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(result == 1)
    }

    async fn sorted_renew(
        &self,
        key: &str,
        member: &str,
        score: f64,
        now: f64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let result: i64 = self
            .renew_member
            .key(key)
            .arg(member)
            .arg(score)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(script_err)?;
        Ok(result == 1)
    }
}
