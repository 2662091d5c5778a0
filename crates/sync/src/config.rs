use std::time::Duration;

use serde::Deserialize;

use crate::error::CoordinationError;
use crate::keys::KeySpace;

/// Top-level configuration for the coordination primitives.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Prefix applied to every store key. Defaults to `"fleetlock"`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Defaults for exclusive execution guards.
    #[serde(default)]
    pub lock: LockConfig,

    /// Defaults for counting semaphores.
    #[serde(default)]
    pub semaphore: SemaphoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            lock: LockConfig::default(),
            semaphore: SemaphoreConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, CoordinationError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| CoordinationError::Config(format!("invalid sync config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Store key layout under the configured prefix.
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.prefix.clone())
    }

    /// Check that every duration that must be positive is.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.prefix.is_empty() {
            return Err(CoordinationError::Config("prefix must not be empty".into()));
        }
        self.lock.validate()?;
        self.semaphore.validate()
    }
}

impl From<&SyncConfig> for KeySpace {
    fn from(config: &SyncConfig) -> Self {
        config.key_space()
    }
}

/// Configuration for exclusive execution guards.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lease time-to-live (milliseconds). Renewed every half TTL.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// How long a blocking guard waits for the lock (milliseconds).
    /// `None` waits forever.
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: Option<u64>,

    /// Holding the lock longer than this (milliseconds) logs a warning.
    #[serde(default = "default_expected_hold_ms")]
    pub expected_hold_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
            expected_hold_ms: default_expected_hold_ms(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn blocking_timeout(&self) -> Option<Duration> {
        self.blocking_timeout_ms.map(Duration::from_millis)
    }

    pub fn expected_hold(&self) -> Duration {
        Duration::from_millis(self.expected_hold_ms)
    }

    fn validate(&self) -> Result<(), CoordinationError> {
        positive("lock.ttl_ms", self.ttl_ms)?;
        if let Some(ms) = self.blocking_timeout_ms {
            positive("lock.blocking_timeout_ms", ms)?;
        }
        Ok(())
    }
}

/// Configuration for counting semaphores.
#[derive(Debug, Clone, Deserialize)]
pub struct SemaphoreConfig {
    /// Slot time-to-live (milliseconds). Scoped holders renew every third
    /// of it.
    #[serde(default = "default_semaphore_ttl_ms")]
    pub ttl_ms: u64,

    /// Whether `acquire` waits for a free slot.
    #[serde(default = "default_blocking")]
    pub blocking: bool,

    /// How long a blocking acquire waits (milliseconds). `None` waits
    /// forever.
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: Option<u64>,

    /// Holding a slot longer than this (milliseconds) logs a warning.
    #[serde(default = "default_expected_hold_ms")]
    pub expected_hold_ms: u64,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_semaphore_ttl_ms(),
            blocking: default_blocking(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
            expected_hold_ms: default_expected_hold_ms(),
        }
    }
}

impl SemaphoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn blocking_timeout(&self) -> Option<Duration> {
        self.blocking_timeout_ms.map(Duration::from_millis)
    }

    pub fn expected_hold(&self) -> Duration {
        Duration::from_millis(self.expected_hold_ms)
    }

    fn validate(&self) -> Result<(), CoordinationError> {
        positive("semaphore.ttl_ms", self.ttl_ms)?;
        if let Some(ms) = self.blocking_timeout_ms {
            positive("semaphore.blocking_timeout_ms", ms)?;
        }
        Ok(())
    }
}

fn positive(field: &str, value: u64) -> Result<(), CoordinationError> {
    if value == 0 {
        return Err(CoordinationError::Config(format!("{field} must be positive")));
    }
    Ok(())
}

fn default_prefix() -> String {
    "fleetlock".to_owned()
}

fn default_lock_ttl_ms() -> u64 {
    10_000
}

fn default_semaphore_ttl_ms() -> u64 {
    10_000
}

#[allow(clippy::unnecessary_wraps)]
fn default_blocking_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_expected_hold_ms() -> u64 {
    30_000
}

fn default_blocking() -> bool {
    true
}
