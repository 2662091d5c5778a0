use std::time::Duration;

use serde::Deserialize;

/// Connection settings for [`RedisCoordinationStore`](crate::RedisCoordinationStore).
///
/// Deserializable so it can sit in the same TOML document as the
/// coordination settings, typically under a `[redis]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum pooled connections. Every lock renewal and semaphore call
    /// borrows one for the duration of a single command or script.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long to wait for a pooled connection (milliseconds) before the
    /// call fails with a connectivity error.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl RedisConfig {
    /// Settings for `url` with default pool sizing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_pool_size() -> usize {
    16
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}
