//! Consistency tuning for the repository and its cache.
//!
//! Controlled via the `[cache]` section of `kvs.toml`.

use std::num::NonZeroU32;
use std::time::Duration;

const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BUS_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
const DEFAULT_PUBLISH_BACKOFF_MS: u64 = 50;

/// Cache and write-path configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound for a single durable-store call.
    pub store_timeout: Duration,
    /// Upper bound for a single publish attempt.
    pub bus_timeout: Duration,
    /// Publish attempts before a write reports the notification as lost.
    pub publish_attempts: NonZeroU32,
    /// Delay before the second publish attempt; doubled for each further one.
    pub publish_backoff: Duration,
    /// Load every durable entry into the cache before serving.
    pub warm_on_startup: bool,
    /// Treat an uncached, unmarked key as remotely modified.
    pub read_through_on_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            bus_timeout: Duration::from_millis(DEFAULT_BUS_TIMEOUT_MS),
            publish_attempts: NonZeroU32::new(DEFAULT_PUBLISH_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            publish_backoff: Duration::from_millis(DEFAULT_PUBLISH_BACKOFF_MS),
            warm_on_startup: true,
            read_through_on_miss: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            store_timeout: settings.store_timeout,
            bus_timeout: settings.bus_timeout,
            publish_attempts: settings.publish_attempts,
            publish_backoff: settings.publish_backoff,
            warm_on_startup: settings.warm_on_startup,
            read_through_on_miss: settings.read_through_on_miss,
        }
    }
}

impl CacheConfig {
    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.publish_backoff.saturating_mul(1 << shift)
    }
}
